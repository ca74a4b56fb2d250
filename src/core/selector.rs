//! Phase 2: resolve the serializer configuration in a fresh read-only session.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{MessagingSerializerConfiguration, PluginConfiguration, SerializerConfiguration, SerializerId};
use crate::plugins::{PluginManager, RenderEnginePlugin};
use crate::store::{Database, SessionMode};

use super::error::CheckoutError;

/// Which kind of serializer a request resolved to
pub enum SerializerSelection {
    Plain {
        configuration: SerializerConfiguration,
        render_engine: Option<Arc<dyn RenderEnginePlugin>>,
    },
    Messaging {
        configuration: MessagingSerializerConfiguration,
    },
    /// No configuration with that id
    Missing,
}

impl std::fmt::Debug for SerializerSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializerSelection::Plain {
                configuration,
                render_engine,
            } => f
                .debug_struct("Plain")
                .field("configuration", configuration)
                .field("render_engine", &render_engine.as_ref().map(|e| e.name().to_string()))
                .finish(),
            SerializerSelection::Messaging { configuration } => {
                f.debug_struct("Messaging").field("configuration", configuration).finish()
            }
            SerializerSelection::Missing => f.write_str("Missing"),
        }
    }
}

/// Read the configuration and resolve its render engine.
///
/// The session is closed before returning on every path.
pub fn select(
    database: &dyn Database,
    plugins: &dyn PluginManager,
    serializer_id: SerializerId,
) -> Result<SerializerSelection, CheckoutError> {
    let mut session = database.open_session(SessionMode::ReadOnly)?;
    let configuration = session.plugin_configuration(serializer_id);
    session.close();

    match configuration? {
        None => Ok(SerializerSelection::Missing),
        Some(PluginConfiguration::MessagingSerializer(configuration)) => {
            Ok(SerializerSelection::Messaging { configuration })
        }
        Some(PluginConfiguration::Serializer(configuration)) => {
            let render_engine = match &configuration.render_engine {
                Some(engine) => plugins.render_engine(&engine.plugin_class, true)?,
                None => None,
            };
            debug!(
                %serializer_id,
                plugin_class = %configuration.plugin_class,
                render_engine = render_engine.as_ref().map(|e| e.name()),
                "Resolved serializer"
            );
            Ok(SerializerSelection::Plain {
                configuration,
                render_engine,
            })
        }
        Some(other) => Err(CheckoutError::UnsupportedConfiguration {
            serializer_id,
            kind: other.kind().to_string(),
        }),
    }
}
