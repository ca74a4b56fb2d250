//! Plain text listing, one line per object.
//!
//! The header names the exporting user, so the output is per-request and
//! never cached.

use std::sync::Arc;

use bytes::Bytes;

use crate::domain::Model;

use super::{SerializerContext, SerializerError, Serializer, TypeFilter};

pub struct TextSerializer {
    model: Arc<Model>,
    filter: TypeFilter,
    header: Option<String>,
    position: usize,
}

impl TextSerializer {
    pub fn new(context: SerializerContext) -> Result<Self, SerializerError> {
        let header = format!(
            "# {} (revision {}) exported by {}\n",
            context.model.name, context.revision.number, context.username
        );
        Ok(Self {
            filter: TypeFilter::from_params(&context.params)?,
            model: context.model,
            header: Some(header),
            position: 0,
        })
    }
}

impl Serializer for TextSerializer {
    fn allow_caching(&self) -> bool {
        false
    }

    fn extension(&self) -> &str {
        "txt"
    }

    fn next_chunk(&mut self) -> Result<Option<Bytes>, SerializerError> {
        if let Some(header) = self.header.take() {
            return Ok(Some(Bytes::from(header)));
        }

        while let Some(object) = self.model.objects.get(self.position) {
            self.position += 1;
            if !self.filter.matches(object) {
                continue;
            }

            let mut line = format!("{} {}", object.oid, object.type_name);
            for (key, value) in &object.attributes {
                line.push_str(&format!(" {}={}", key, value));
            }
            line.push('\n');
            return Ok(Some(Bytes::from(line)));
        }

        Ok(None)
    }
}
