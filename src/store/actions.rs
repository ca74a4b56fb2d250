//! Database actions that load a revision's model.
//!
//! `CheckoutAction` records the checkout for the user as part of the same
//! transaction; `DownloadAction` only reads.

use tracing::{debug, warn};

use crate::domain::{Model, RevisionId, SerializerId};

use super::{CheckoutRecord, DatabaseAction, StoreError, Transaction};

/// Load the model of a revision and record a checkout
#[derive(Debug, Clone)]
pub struct CheckoutAction {
    pub revision_id: RevisionId,
    pub serializer_id: SerializerId,
    pub username: String,
}

impl CheckoutAction {
    pub fn new(revision_id: RevisionId, serializer_id: SerializerId, username: impl Into<String>) -> Self {
        Self {
            revision_id,
            serializer_id,
            username: username.into(),
        }
    }
}

impl DatabaseAction for CheckoutAction {
    fn name(&self) -> &str {
        "checkout"
    }

    fn execute(&self, tx: &mut dyn Transaction) -> Result<Model, StoreError> {
        let model = load_model(tx, self.revision_id)?;
        tx.record_checkout(&CheckoutRecord::new(
            self.revision_id,
            self.serializer_id,
            self.username.clone(),
        ))?;
        Ok(model)
    }
}

/// Load the model of a revision without writing anything
#[derive(Debug, Clone)]
pub struct DownloadAction {
    pub revision_id: RevisionId,
}

impl DownloadAction {
    pub fn new(revision_id: RevisionId) -> Self {
        Self { revision_id }
    }
}

impl DatabaseAction for DownloadAction {
    fn name(&self) -> &str {
        "download"
    }

    fn execute(&self, tx: &mut dyn Transaction) -> Result<Model, StoreError> {
        load_model(tx, self.revision_id)
    }
}

/// Load and decode all objects of a revision.
///
/// Objects whose attributes cannot be decoded are skipped and the model is
/// marked invalid instead of failing the transaction.
fn load_model(tx: &mut dyn Transaction, revision_id: RevisionId) -> Result<Model, StoreError> {
    let revision = tx.revision(revision_id)?.ok_or_else(|| StoreError::NotFound {
        kind: "revision",
        id: revision_id.to_string(),
    })?;
    let project = tx.project(revision.project_id)?.ok_or_else(|| StoreError::NotFound {
        kind: "project",
        id: revision.project_id.to_string(),
    })?;

    let stored = tx.objects(revision_id)?;
    let mut objects = Vec::with_capacity(stored.len());
    let mut undecodable = 0usize;

    for object in &stored {
        match object.decode() {
            Ok(decoded) => objects.push(decoded),
            Err(e) => {
                undecodable += 1;
                warn!(oid = object.oid, %revision_id, error = %e, "Skipping undecodable object");
            }
        }
    }

    debug!(%revision_id, objects = objects.len(), undecodable, "Loaded model");

    let model = Model::new(
        format!("{}-r{}", project.name, revision.number),
        revision.number,
        objects,
    );

    Ok(if undecodable > 0 { model.invalidate() } else { model })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewObject, StoredObject};
    use crate::store::{Database, MemoryDatabase, SessionMode};
    use serde_json::json;

    fn wall() -> NewObject {
        serde_json::from_value(json!({"type": "Wall", "attributes": {"height": 3.0}})).unwrap()
    }

    #[test]
    fn test_checkout_action_records_checkout() {
        let db = MemoryDatabase::new();
        let project = db.add_project("site");
        let revision = db.add_revision(project.id, vec![wall(), wall()]);

        let session = db.open_session(SessionMode::ReadWrite).unwrap();
        let action = CheckoutAction::new(revision.id, SerializerId(1), "alice");
        let model = session.execute_and_commit(&action).unwrap();

        assert_eq!(model.name, "site-r1");
        assert_eq!(model.objects.len(), 2);
        assert!(model.is_valid());

        let checkouts = db.checkouts();
        assert_eq!(checkouts.len(), 1);
        assert_eq!(checkouts[0].username, "alice");
        assert_eq!(checkouts[0].revision_id, revision.id);
    }

    #[test]
    fn test_download_action_does_not_write() {
        let db = MemoryDatabase::new();
        let project = db.add_project("site");
        let revision = db.add_revision(project.id, vec![wall()]);

        let session = db.open_session(SessionMode::ReadWrite).unwrap();
        session.execute_and_commit(&DownloadAction::new(revision.id)).unwrap();

        assert!(db.checkouts().is_empty());
    }

    #[test]
    fn test_undecodable_objects_invalidate_model() {
        let db = MemoryDatabase::new();
        let project = db.add_project("site");
        let revision = db.add_revision(project.id, vec![wall()]);
        db.add_stored_object(
            revision.id,
            StoredObject {
                oid: 999,
                type_name: "Door".to_string(),
                attributes: "{broken".to_string(),
            },
        );

        let session = db.open_session(SessionMode::ReadWrite).unwrap();
        let model = session.execute_and_commit(&DownloadAction::new(revision.id)).unwrap();

        assert!(!model.is_valid());
        assert_eq!(model.objects.len(), 1);
    }

    #[test]
    fn test_missing_revision_fails_transaction() {
        let db = MemoryDatabase::new();

        let session = db.open_session(SessionMode::ReadWrite).unwrap();
        let err = session
            .execute_and_commit(&DownloadAction::new(RevisionId(5)))
            .unwrap_err();

        assert!(matches!(err, StoreError::NotFound { kind: "revision", .. }));
        assert_eq!(db.commits(), 0);
    }
}
