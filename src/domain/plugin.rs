//! Persisted plugin configuration records.
//!
//! A configuration is loaded by id and is exactly one of the variants
//! below. Records of kinds this crate does not serve (deserializers,
//! query engines, ...) are kept as `Other` so callers decide explicitly
//! what to do with them.

use serde::{Deserialize, Serialize};

use super::revision::SerializerId;

/// Kind column value for plain serializers
pub const KIND_SERIALIZER: &str = "serializer";

/// Kind column value for messaging serializers
pub const KIND_MESSAGING_SERIALIZER: &str = "messaging_serializer";

/// Render engine bound to a serializer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderEngineConfiguration {
    pub name: String,
    pub plugin_class: String,
}

/// Configuration of a plain (file-like) serializer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializerConfiguration {
    pub id: SerializerId,
    pub name: String,
    pub plugin_class: String,
    pub render_engine: Option<RenderEngineConfiguration>,
}

/// Configuration of a continuous message serializer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingSerializerConfiguration {
    pub id: SerializerId,
    pub name: String,
    pub plugin_class: String,
}

/// A plugin configuration record as loaded from the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PluginConfiguration {
    Serializer(SerializerConfiguration),
    MessagingSerializer(MessagingSerializerConfiguration),
    Other {
        id: SerializerId,
        name: String,
        #[serde(rename = "other_kind")]
        kind: String,
    },
}

impl PluginConfiguration {
    pub fn id(&self) -> SerializerId {
        match self {
            Self::Serializer(c) => c.id,
            Self::MessagingSerializer(c) => c.id,
            Self::Other { id, .. } => *id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Serializer(c) => &c.name,
            Self::MessagingSerializer(c) => &c.name,
            Self::Other { name, .. } => name,
        }
    }

    /// Kind as stored in the database
    pub fn kind(&self) -> &str {
        match self {
            Self::Serializer(_) => KIND_SERIALIZER,
            Self::MessagingSerializer(_) => KIND_MESSAGING_SERIALIZER,
            Self::Other { kind, .. } => kind,
        }
    }
}

/// A plugin configuration to be inserted, before it has an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPluginConfiguration {
    pub kind: String,
    pub name: String,
    pub plugin_class: String,
    pub render_engine: Option<RenderEngineConfiguration>,
}

impl NewPluginConfiguration {
    pub fn serializer(name: impl Into<String>, plugin_class: impl Into<String>) -> Self {
        Self {
            kind: KIND_SERIALIZER.to_string(),
            name: name.into(),
            plugin_class: plugin_class.into(),
            render_engine: None,
        }
    }

    pub fn messaging_serializer(name: impl Into<String>, plugin_class: impl Into<String>) -> Self {
        Self {
            kind: KIND_MESSAGING_SERIALIZER.to_string(),
            name: name.into(),
            plugin_class: plugin_class.into(),
            render_engine: None,
        }
    }

    pub fn with_render_engine(mut self, name: impl Into<String>, plugin_class: impl Into<String>) -> Self {
        self.render_engine = Some(RenderEngineConfiguration {
            name: name.into(),
            plugin_class: plugin_class.into(),
        });
        self
    }

    /// Attach an id, producing the record as it will be loaded back
    pub fn into_configuration(self, id: SerializerId) -> PluginConfiguration {
        match self.kind.as_str() {
            KIND_SERIALIZER => PluginConfiguration::Serializer(SerializerConfiguration {
                id,
                name: self.name,
                plugin_class: self.plugin_class,
                render_engine: self.render_engine,
            }),
            KIND_MESSAGING_SERIALIZER => {
                PluginConfiguration::MessagingSerializer(MessagingSerializerConfiguration {
                    id,
                    name: self.name,
                    plugin_class: self.plugin_class,
                })
            }
            _ => PluginConfiguration::Other {
                id,
                name: self.name,
                kind: self.kind,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_configuration_by_kind() {
        let plain = NewPluginConfiguration::serializer("json", "json")
            .with_render_engine("boxes", "bounding-box")
            .into_configuration(SerializerId(1));
        assert!(matches!(plain, PluginConfiguration::Serializer(ref c) if c.render_engine.is_some()));
        assert_eq!(plain.kind(), KIND_SERIALIZER);

        let messaging =
            NewPluginConfiguration::messaging_serializer("stream", "json-messages").into_configuration(SerializerId(2));
        assert_eq!(messaging.kind(), KIND_MESSAGING_SERIALIZER);

        let other = NewPluginConfiguration {
            kind: "deserializer".to_string(),
            name: "ifc".to_string(),
            plugin_class: "ifc-reader".to_string(),
            render_engine: None,
        }
        .into_configuration(SerializerId(3));
        assert_eq!(other.kind(), "deserializer");
        assert_eq!(other.id(), SerializerId(3));
        assert_eq!(other.name(), "ifc");
    }
}
