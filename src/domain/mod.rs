//! Domain types for the modelout orchestrator.
//!
//! This module contains the core data structures:
//! - Revision: Stored snapshots and their identifiers
//! - Descriptor: What a caller asks for (and the cache key)
//! - Model: Objects loaded from a revision
//! - Plugin: Persisted serializer configuration records
//! - State: Lifecycle of a single request

pub mod descriptor;
pub mod model;
pub mod plugin;
pub mod revision;
pub mod state;

// Re-export commonly used types
pub use descriptor::RequestDescriptor;
pub use model::{Model, ModelObject, NewObject, StoredObject};
pub use plugin::{
    MessagingSerializerConfiguration, NewPluginConfiguration, PluginConfiguration,
    RenderEngineConfiguration, SerializerConfiguration, KIND_MESSAGING_SERIALIZER,
    KIND_SERIALIZER,
};
pub use revision::{Project, ProjectId, Revision, RevisionId, RevisionSummary, SerializerId};
pub use state::ActionState;
