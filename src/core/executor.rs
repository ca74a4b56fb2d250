//! Phase 1: run the caller's action and commit it.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{Model, Project, Revision, RevisionId};
use crate::store::{Database, DatabaseAction, Session, SessionMode};

use super::error::CheckoutError;

/// What phase 2 needs from phase 1.
///
/// Everything here is loaded before commit; the session is gone afterwards.
#[derive(Debug, Clone)]
pub struct Handoff {
    pub revision: Revision,
    pub project: Project,
    pub model: Arc<Model>,
}

fn load_owners(session: &mut dyn Session, revision_id: RevisionId) -> Result<(Revision, Project), CheckoutError> {
    let revision = session.revision(revision_id)?.ok_or_else(|| CheckoutError::NotFound {
        kind: "revision",
        id: revision_id.to_string(),
    })?;
    let project = session.project(revision.project_id)?.ok_or_else(|| CheckoutError::NotFound {
        kind: "project",
        id: revision.project_id.to_string(),
    })?;
    Ok((revision, project))
}

/// Resolve the revision, then execute `action` and commit in one session.
///
/// A missing revision aborts before anything is committed.
pub fn execute(
    database: &dyn Database,
    revision_id: RevisionId,
    action: &dyn DatabaseAction,
) -> Result<Handoff, CheckoutError> {
    let mut session = database.open_session(SessionMode::ReadWrite)?;

    let (revision, project) = match load_owners(session.as_mut(), revision_id) {
        Ok(owners) => owners,
        Err(err) => {
            session.close();
            return Err(err);
        }
    };

    debug!(action = action.name(), %revision_id, "Executing action");
    let model = session.execute_and_commit(action)?;

    Ok(Handoff {
        revision,
        project,
        model: Arc::new(model),
    })
}
