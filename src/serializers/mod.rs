//! Serializers turn a loaded model into output bytes.
//!
//! Serializers are pull-based: each call produces the next chunk, so output
//! is only generated as fast as the consumer drains it. Two kinds exist:
//! - `Serializer`: file-like output, optionally cacheable
//! - `MessagingSerializer`: a sequence of discrete messages
//!
//! `PluginSerializerFactory` maps a configuration's plugin class to one of
//! the built-in implementations.

pub mod json;
pub mod messaging;
pub mod text;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::domain::{
    MessagingSerializerConfiguration, Model, ModelObject, Revision, SerializerConfiguration,
};
use crate::plugins::RenderEnginePlugin;

pub use json::JsonSerializer;
pub use messaging::JsonMessagingSerializer;
pub use text::TextSerializer;

/// Plugin class of the JSON document serializer
pub const JSON_SERIALIZER: &str = "json";

/// Plugin class of the plain text listing serializer
pub const TEXT_SERIALIZER: &str = "text";

/// Plugin class of the JSON message serializer
pub const JSON_MESSAGES_SERIALIZER: &str = "json-messages";

/// Parameter restricting output to a comma-separated list of object types
pub const PARAM_TYPES: &str = "types";

/// Parameter setting how many objects go into one chunk
pub const PARAM_BATCH: &str = "batch";

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("unknown serializer plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// File-like serializer producing a finite byte sequence
pub trait Serializer: Send {
    /// Whether the output may be stored and replayed
    fn allow_caching(&self) -> bool;

    /// File extension of the output, without the dot
    fn extension(&self) -> &str;

    /// Next chunk of output, `None` once everything is written
    fn next_chunk(&mut self) -> Result<Option<Bytes>, SerializerError>;
}

/// Serializer producing a sequence of discrete messages
pub trait MessagingSerializer: Send {
    /// Next message, `None` once the stream is complete
    fn next_message(&mut self) -> Result<Option<Bytes>, SerializerError>;
}

/// Everything a plain serializer is bound to
pub struct SerializerContext {
    pub revision: Revision,
    pub username: String,
    pub model: Arc<Model>,
    pub render_engine: Option<Arc<dyn RenderEnginePlugin>>,
    pub params: BTreeMap<String, String>,
}

/// Builds serializers from stored configurations
pub trait SerializerFactory: Send + Sync {
    /// Whether serializers built from this configuration are cacheable.
    ///
    /// Lets a cached artifact be replayed without building a serializer.
    fn allows_caching(&self, configuration: &SerializerConfiguration) -> bool;

    /// Build a plain serializer; `Ok(None)` if the plugin is not available
    fn create(
        &self,
        configuration: &SerializerConfiguration,
        context: SerializerContext,
    ) -> Result<Option<Box<dyn Serializer>>, SerializerError>;

    fn create_messaging_serializer(
        &self,
        configuration: &MessagingSerializerConfiguration,
        username: &str,
        model: Arc<Model>,
        params: &BTreeMap<String, String>,
    ) -> Result<Box<dyn MessagingSerializer>, SerializerError>;
}

/// Factory for the built-in serializers
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginSerializerFactory;

impl SerializerFactory for PluginSerializerFactory {
    fn allows_caching(&self, configuration: &SerializerConfiguration) -> bool {
        configuration.plugin_class == JSON_SERIALIZER
    }

    fn create(
        &self,
        configuration: &SerializerConfiguration,
        context: SerializerContext,
    ) -> Result<Option<Box<dyn Serializer>>, SerializerError> {
        match configuration.plugin_class.as_str() {
            JSON_SERIALIZER => Ok(Some(Box::new(JsonSerializer::new(context)?))),
            TEXT_SERIALIZER => Ok(Some(Box::new(TextSerializer::new(context)?))),
            _ => Ok(None),
        }
    }

    fn create_messaging_serializer(
        &self,
        configuration: &MessagingSerializerConfiguration,
        _username: &str,
        model: Arc<Model>,
        params: &BTreeMap<String, String>,
    ) -> Result<Box<dyn MessagingSerializer>, SerializerError> {
        match configuration.plugin_class.as_str() {
            JSON_MESSAGES_SERIALIZER => Ok(Box::new(JsonMessagingSerializer::new(model, params)?)),
            other => Err(SerializerError::UnknownPlugin(other.to_string())),
        }
    }
}

/// Object type filter taken from the `types` parameter
#[derive(Debug, Clone, Default)]
pub(crate) struct TypeFilter {
    types: Option<BTreeSet<String>>,
}

impl TypeFilter {
    pub(crate) fn from_params(params: &BTreeMap<String, String>) -> Result<Self, SerializerError> {
        let Some(raw) = params.get(PARAM_TYPES) else {
            return Ok(Self::default());
        };

        let types: BTreeSet<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if types.is_empty() {
            return Err(SerializerError::InvalidParameter {
                name: PARAM_TYPES.to_string(),
                reason: "expected at least one type name".to_string(),
            });
        }

        Ok(Self { types: Some(types) })
    }

    pub(crate) fn matches(&self, object: &ModelObject) -> bool {
        self.types
            .as_ref()
            .map(|types| types.contains(&object.type_name))
            .unwrap_or(true)
    }
}

/// Objects per chunk from the `batch` parameter
pub(crate) fn batch_size(params: &BTreeMap<String, String>, default: usize) -> Result<usize, SerializerError> {
    match params.get(PARAM_BATCH) {
        None => Ok(default),
        Some(raw) => match raw.parse::<usize>() {
            Ok(size) if size > 0 => Ok(size),
            _ => Err(SerializerError::InvalidParameter {
                name: PARAM_BATCH.to_string(),
                reason: format!("expected a positive integer, got '{}'", raw),
            }),
        },
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::{ProjectId, RevisionId};
    use chrono::Utc;
    use serde_json::json;

    pub fn model() -> Arc<Model> {
        let objects = vec![
            ModelObject {
                oid: 1,
                type_name: "Wall".to_string(),
                attributes: serde_json::from_value(json!({"placement": [0.0, 0.0, 0.0], "extent": [4.0, 0.2, 3.0]}))
                    .unwrap(),
            },
            ModelObject {
                oid: 2,
                type_name: "Door".to_string(),
                attributes: serde_json::from_value(json!({"width": 0.9})).unwrap(),
            },
            ModelObject {
                oid: 3,
                type_name: "Wall".to_string(),
                attributes: BTreeMap::new(),
            },
        ];
        Arc::new(Model::new("site-r1", 1, objects))
    }

    pub fn context(params: &[(&str, &str)]) -> SerializerContext {
        SerializerContext {
            revision: Revision {
                id: RevisionId(1),
                project_id: ProjectId(1),
                number: 1,
                user: "alice".to_string(),
                comment: String::new(),
                created_at: Utc::now(),
            },
            username: "bob".to_string(),
            model: model(),
            render_engine: None,
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    pub fn drain(serializer: &mut dyn Serializer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = serializer.next_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}
