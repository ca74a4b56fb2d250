//! Continuous JSON message serializer.
//!
//! Emits a `start` message, one `object` message per object and a final
//! `end` message carrying the object count.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use crate::domain::Model;

use super::{MessagingSerializer, SerializerError, TypeFilter};

pub struct JsonMessagingSerializer {
    model: Arc<Model>,
    filter: TypeFilter,
    started: bool,
    finished: bool,
    position: usize,
    sent: usize,
}

impl JsonMessagingSerializer {
    pub fn new(model: Arc<Model>, params: &BTreeMap<String, String>) -> Result<Self, SerializerError> {
        Ok(Self {
            model,
            filter: TypeFilter::from_params(params)?,
            started: false,
            finished: false,
            position: 0,
            sent: 0,
        })
    }
}

impl MessagingSerializer for JsonMessagingSerializer {
    fn next_message(&mut self) -> Result<Option<Bytes>, SerializerError> {
        if self.finished {
            return Ok(None);
        }

        if !self.started {
            self.started = true;
            let message = json!({
                "type": "start",
                "name": self.model.name,
                "revision": self.model.revision_number,
            });
            return Ok(Some(Bytes::from(serde_json::to_vec(&message)?)));
        }

        while let Some(object) = self.model.objects.get(self.position) {
            self.position += 1;
            if !self.filter.matches(object) {
                continue;
            }
            self.sent += 1;
            let message = json!({"type": "object", "object": object});
            return Ok(Some(Bytes::from(serde_json::to_vec(&message)?)));
        }

        self.finished = true;
        let message = json!({"type": "end", "objects": self.sent});
        Ok(Some(Bytes::from(serde_json::to_vec(&message)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::model;
    use super::*;
    use serde_json::Value;

    fn drain(serializer: &mut JsonMessagingSerializer) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Some(message) = serializer.next_message().unwrap() {
            messages.push(serde_json::from_slice(&message).unwrap());
        }
        messages
    }

    #[test]
    fn test_message_sequence() {
        let mut serializer = JsonMessagingSerializer::new(model(), &BTreeMap::new()).unwrap();
        let messages = drain(&mut serializer);

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["type"], "start");
        assert_eq!(messages[1]["object"]["oid"], 1);
        assert_eq!(messages[4]["type"], "end");
        assert_eq!(messages[4]["objects"], 3);
        assert!(serializer.next_message().unwrap().is_none());
    }

    #[test]
    fn test_filtered_messages() {
        let params: BTreeMap<String, String> = [("types".to_string(), "Door".to_string())].into_iter().collect();
        let mut serializer = JsonMessagingSerializer::new(model(), &params).unwrap();
        let messages = drain(&mut serializer);

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["objects"], 1);
    }
}
