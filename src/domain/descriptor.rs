//! Request descriptors identify a desired output.
//!
//! A descriptor doubles as the cache key: two descriptors with identical
//! field values refer to the same output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::revision::{RevisionId, SerializerId};

/// Immutable description of a checkout or download request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Revision to serialize
    pub revision_id: RevisionId,

    /// Serializer configuration to use
    pub serializer_id: SerializerId,

    /// Serializer-specific parameters (ordered, so equal maps compare and hash equal)
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl RequestDescriptor {
    pub fn new(revision_id: RevisionId, serializer_id: SerializerId) -> Self {
        Self {
            revision_id,
            serializer_id,
            params: BTreeMap::new(),
        }
    }

    /// Add a serializer parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stable hex digest of the descriptor, used to name cache files.
    ///
    /// The digest is only a file name; equality is still decided on the
    /// full descriptor.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.revision_id.0.to_le_bytes());
        hasher.update(self.serializer_id.0.to_le_bytes());
        for (key, value) in &self.params {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identical_descriptors_are_equal() {
        let a = RequestDescriptor::new(RevisionId(42), SerializerId(7)).with_param("types", "Wall");
        let b = RequestDescriptor::new(RevisionId(42), SerializerId(7)).with_param("types", "Wall");

        assert_eq!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_param_insertion_order_is_irrelevant() {
        let a = RequestDescriptor::new(RevisionId(1), SerializerId(1))
            .with_param("a", "1")
            .with_param("b", "2");
        let b = RequestDescriptor::new(RevisionId(1), SerializerId(1))
            .with_param("b", "2")
            .with_param("a", "1");

        assert_eq!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_cache_key_distinguishes_fields() {
        let base = RequestDescriptor::new(RevisionId(1), SerializerId(2));

        assert_ne!(
            base.cache_key(),
            RequestDescriptor::new(RevisionId(2), SerializerId(1)).cache_key()
        );
        assert_ne!(base.cache_key(), base.clone().with_param("x", "").cache_key());
        // Length prefixes keep "ab"="" apart from "a"="b"
        assert_ne!(
            base.clone().with_param("ab", "").cache_key(),
            base.clone().with_param("a", "b").cache_key()
        );
    }

    #[test]
    fn test_cache_key_is_full_sha256_hex() {
        let key = RequestDescriptor::new(RevisionId(42), SerializerId(7)).cache_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
