//! Projects, revisions and the identifiers used to look them up.
//!
//! Revisions are immutable once persisted; this crate only ever reads them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

object_id!(
    /// Identifier of a stored revision
    RevisionId
);
object_id!(
    /// Identifier of a project
    ProjectId
);
object_id!(
    /// Identifier of a serializer plugin configuration
    SerializerId
);

/// A project owning a sequence of revisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable, already-persisted snapshot of a project's model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,

    /// Owning project. Only the id is materialized; the project itself
    /// has to be loaded explicitly while the session is still open.
    pub project_id: ProjectId,

    /// Sequential number within the project, starting at 1
    pub number: u32,

    /// Who committed the revision
    pub user: String,

    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// A revision listed together with its project, for overviews
#[derive(Debug, Clone, Serialize)]
pub struct RevisionSummary {
    pub revision: Revision,
    pub project_name: String,
    pub object_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&RevisionId(42)).unwrap();
        assert_eq!(json, "42");

        let parsed: SerializerId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, SerializerId(7));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ProjectId(3).to_string(), "3");
        assert_eq!(RevisionId::from(9).to_string(), "9");
    }
}
