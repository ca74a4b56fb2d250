//! Lifecycle state of a single checkout or download request.

use serde::{Deserialize, Serialize};

/// State of a request: `Pending` until it settles exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ActionState {
    /// Output not yet fully produced
    Pending,

    /// Output fully produced and drained
    Finished,

    /// The request ended without a complete output
    Failed { error: String },
}

impl Default for ActionState {
    fn default() -> Self {
        Self::Pending
    }
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}
