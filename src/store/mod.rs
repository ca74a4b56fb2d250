//! Transactional session interfaces and their implementations.
//!
//! The orchestrator talks to storage only through these traits:
//! - `Database` opens sessions
//! - `Session` reads entities and runs one action to commit
//! - `Transaction` is what an action sees while it runs
//! - `DatabaseAction` is the caller-supplied operation
//!
//! `Session::execute_and_commit` consumes the session. A session cannot be
//! used once its transaction has committed, so any data needed afterwards
//! must be loaded before the call.

pub mod actions;
pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Model, PluginConfiguration, Project, ProjectId, Revision, RevisionId, SerializerId, StoredObject};

pub use actions::{CheckoutAction, DownloadAction};
pub use memory::MemoryDatabase;
pub use sqlite::SqliteDatabase;

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("session is read-only")]
    ReadOnly,

    #[error("storage failure: {0}")]
    Backend(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a session is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// May run one action and commit it
    ReadWrite,

    /// Reads only; `execute_and_commit` fails
    ReadOnly,
}

/// A recorded checkout of a revision by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRecord {
    pub id: Uuid,
    pub revision_id: RevisionId,
    pub serializer_id: SerializerId,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

impl CheckoutRecord {
    pub fn new(revision_id: RevisionId, serializer_id: SerializerId, username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            revision_id,
            serializer_id,
            username: username.into(),
            created_at: Utc::now(),
        }
    }
}

/// Provider of transactional sessions
pub trait Database: Send + Sync {
    /// Open a new session, exclusively owned by the caller
    fn open_session(&self, mode: SessionMode) -> Result<Box<dyn Session>, StoreError>;
}

/// A session scope. Closed on drop if not closed explicitly.
pub trait Session: Send {
    fn mode(&self) -> SessionMode;

    fn revision(&mut self, id: RevisionId) -> Result<Option<Revision>, StoreError>;

    fn project(&mut self, id: ProjectId) -> Result<Option<Project>, StoreError>;

    fn plugin_configuration(&mut self, id: SerializerId) -> Result<Option<PluginConfiguration>, StoreError>;

    /// Run the action in a transaction and commit it.
    ///
    /// The session is consumed: after commit it is closed.
    fn execute_and_commit(self: Box<Self>, action: &dyn DatabaseAction) -> Result<Model, StoreError>;

    fn close(self: Box<Self>);
}

/// Access an action has while its transaction is open
pub trait Transaction {
    fn revision(&mut self, id: RevisionId) -> Result<Option<Revision>, StoreError>;

    fn project(&mut self, id: ProjectId) -> Result<Option<Project>, StoreError>;

    /// All objects of a revision, in oid order
    fn objects(&mut self, revision_id: RevisionId) -> Result<Vec<StoredObject>, StoreError>;

    fn record_checkout(&mut self, record: &CheckoutRecord) -> Result<(), StoreError>;
}

/// A caller-supplied operation run inside a read-write session
pub trait DatabaseAction: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &str;

    fn execute(&self, tx: &mut dyn Transaction) -> Result<Model, StoreError>;
}
