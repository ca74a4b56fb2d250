//! In-memory database with copy-on-commit transactions.
//!
//! Used by tests and embedders that do not need persistence. Counters for
//! opened sessions and commits make the session protocol observable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::domain::{
    Model, NewObject, PluginConfiguration, Project, ProjectId, Revision, RevisionId, SerializerId,
    StoredObject,
};

use super::{CheckoutRecord, Database, DatabaseAction, Session, SessionMode, StoreError, Transaction};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    projects: BTreeMap<ProjectId, Project>,
    revisions: BTreeMap<RevisionId, Revision>,
    objects: BTreeMap<RevisionId, Vec<StoredObject>>,
    plugins: BTreeMap<SerializerId, PluginConfiguration>,
    checkouts: Vec<CheckoutRecord>,
    last_id: i64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn reserve_id(&mut self, id: i64) {
        self.last_id = self.last_id.max(id);
    }
}

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicUsize,
    sessions_open: AtomicUsize,
    commits: AtomicUsize,
    fail_plugin_reads: AtomicBool,
}

/// Thread-safe in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_project(&self, name: impl Into<String>) -> Project {
        let mut state = self.state();
        let project = Project {
            id: ProjectId(state.allocate_id()),
            name: name.into(),
            created_at: Utc::now(),
        };
        state.projects.insert(project.id, project.clone());
        project
    }

    /// Add the next revision of a project
    pub fn add_revision(&self, project_id: ProjectId, objects: Vec<NewObject>) -> Revision {
        let id = RevisionId(self.state().allocate_id());
        self.add_revision_with_id(id, project_id, objects)
    }

    /// Add the next revision of a project under a fixed id
    pub fn add_revision_with_id(&self, id: RevisionId, project_id: ProjectId, objects: Vec<NewObject>) -> Revision {
        let mut state = self.state();
        state.reserve_id(id.0);

        let number = state
            .revisions
            .values()
            .filter(|r| r.project_id == project_id)
            .count() as u32
            + 1;
        let revision = Revision {
            id,
            project_id,
            number,
            user: "system".to_string(),
            comment: String::new(),
            created_at: Utc::now(),
        };

        let mut stored = Vec::with_capacity(objects.len());
        for object in objects {
            let oid = state.allocate_id();
            stored.push(StoredObject {
                oid,
                type_name: object.type_name,
                attributes: serde_json::Value::Object(object.attributes.into_iter().collect()).to_string(),
            });
        }

        state.revisions.insert(id, revision.clone());
        state.objects.insert(id, stored);
        revision
    }

    /// Append a raw object row to a revision, bypassing encoding
    pub fn add_stored_object(&self, revision_id: RevisionId, object: StoredObject) {
        let mut state = self.state();
        state.reserve_id(object.oid);
        state.objects.entry(revision_id).or_default().push(object);
    }

    pub fn add_plugin_configuration(&self, configuration: PluginConfiguration) {
        let mut state = self.state();
        state.reserve_id(configuration.id().0);
        state.plugins.insert(configuration.id(), configuration);
    }

    /// Make every plugin configuration read fail with a backend error
    pub fn fail_plugin_reads(&self, fail: bool) {
        self.counters.fail_plugin_reads.store(fail, Ordering::SeqCst);
    }

    pub fn checkouts(&self) -> Vec<CheckoutRecord> {
        self.state().checkouts.clone()
    }

    /// Number of committed transactions
    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    /// Number of sessions ever opened
    pub fn sessions_opened(&self) -> usize {
        self.counters.sessions_opened.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open
    pub fn sessions_open(&self) -> usize {
        self.counters.sessions_open.load(Ordering::SeqCst)
    }
}

impl Database for MemoryDatabase {
    fn open_session(&self, mode: SessionMode) -> Result<Box<dyn Session>, StoreError> {
        self.counters.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.counters.sessions_open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            mode,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
    mode: SessionMode,
}

impl MemorySession {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.counters.sessions_open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Session for MemorySession {
    fn mode(&self) -> SessionMode {
        self.mode
    }

    fn revision(&mut self, id: RevisionId) -> Result<Option<Revision>, StoreError> {
        Ok(self.state().revisions.get(&id).cloned())
    }

    fn project(&mut self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.state().projects.get(&id).cloned())
    }

    fn plugin_configuration(&mut self, id: SerializerId) -> Result<Option<PluginConfiguration>, StoreError> {
        if self.counters.fail_plugin_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!(
                "injected failure reading plugin configuration {}",
                id
            )));
        }
        Ok(self.state().plugins.get(&id).cloned())
    }

    fn execute_and_commit(self: Box<Self>, action: &dyn DatabaseAction) -> Result<Model, StoreError> {
        if self.mode == SessionMode::ReadOnly {
            return Err(StoreError::ReadOnly);
        }

        // Transactions are serialized by holding the lock for the whole action
        let mut state = self.state();
        let mut working = state.clone();
        let model = action.execute(&mut MemoryTransaction { state: &mut working })?;
        *state = working;
        self.counters.commits.fetch_add(1, Ordering::SeqCst);

        Ok(model)
    }

    fn close(self: Box<Self>) {}
}

struct MemoryTransaction<'a> {
    state: &'a mut MemoryState,
}

impl Transaction for MemoryTransaction<'_> {
    fn revision(&mut self, id: RevisionId) -> Result<Option<Revision>, StoreError> {
        Ok(self.state.revisions.get(&id).cloned())
    }

    fn project(&mut self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.state.projects.get(&id).cloned())
    }

    fn objects(&mut self, revision_id: RevisionId) -> Result<Vec<StoredObject>, StoreError> {
        let mut objects = self.state.objects.get(&revision_id).cloned().unwrap_or_default();
        objects.sort_by_key(|o| o.oid);
        Ok(objects)
    }

    fn record_checkout(&mut self, record: &CheckoutRecord) -> Result<(), StoreError> {
        self.state.checkouts.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewPluginConfiguration;
    use crate::store::DownloadAction;

    #[test]
    fn test_sessions_are_counted() {
        let db = MemoryDatabase::new();

        let session = db.open_session(SessionMode::ReadOnly).unwrap();
        assert_eq!(db.sessions_open(), 1);
        session.close();

        assert_eq!(db.sessions_open(), 0);
        assert_eq!(db.sessions_opened(), 1);
    }

    #[test]
    fn test_read_only_session_rejects_commit() {
        let db = MemoryDatabase::new();
        let project = db.add_project("site");
        let revision = db.add_revision(project.id, Vec::new());

        let session = db.open_session(SessionMode::ReadOnly).unwrap();
        let err = session
            .execute_and_commit(&DownloadAction::new(revision.id))
            .unwrap_err();

        assert!(matches!(err, StoreError::ReadOnly));
        assert_eq!(db.commits(), 0);
        assert_eq!(db.sessions_open(), 0);
    }

    #[test]
    fn test_revision_numbers_are_sequential_per_project() {
        let db = MemoryDatabase::new();
        let a = db.add_project("a");
        let b = db.add_project("b");

        assert_eq!(db.add_revision(a.id, Vec::new()).number, 1);
        assert_eq!(db.add_revision(a.id, Vec::new()).number, 2);
        assert_eq!(db.add_revision(b.id, Vec::new()).number, 1);
    }

    #[test]
    fn test_fixed_ids_do_not_collide_with_allocated_ones() {
        let db = MemoryDatabase::new();
        let project = db.add_project("site");
        let fixed = db.add_revision_with_id(RevisionId(42), project.id, Vec::new());
        let next = db.add_revision(project.id, Vec::new());

        assert_eq!(fixed.id, RevisionId(42));
        assert!(next.id.0 > 42);
    }

    #[test]
    fn test_injected_plugin_read_failure() {
        let db = MemoryDatabase::new();
        db.add_plugin_configuration(
            NewPluginConfiguration::serializer("json", "json").into_configuration(SerializerId(7)),
        );
        db.fail_plugin_reads(true);

        let mut session = db.open_session(SessionMode::ReadOnly).unwrap();
        assert!(session.plugin_configuration(SerializerId(7)).is_err());
    }
}
