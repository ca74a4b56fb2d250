//! Request-level errors returned by the orchestrator.

use thiserror::Error;

use crate::cache::CacheError;
use crate::domain::SerializerId;
use crate::plugins::PluginError;
use crate::serializers::SerializerError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("serializer {serializer_id} not found or failed to initialize: {reason}")]
    SerializerInit {
        serializer_id: SerializerId,
        reason: String,
    },

    #[error("configuration {serializer_id} is a {kind}, not a serializer")]
    UnsupportedConfiguration {
        serializer_id: SerializerId,
        kind: String,
    },

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Serializer error: {0}")]
    Serializer(#[from] SerializerError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("session worker failed: {0}")]
    Worker(String),
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => CheckoutError::NotFound { kind, id },
            other => CheckoutError::Store(other),
        }
    }
}

impl CheckoutError {
    /// Errors caused by the request itself rather than the server
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            CheckoutError::NotFound { .. }
                | CheckoutError::SerializerInit { .. }
                | CheckoutError::UnsupportedConfiguration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: CheckoutError = StoreError::NotFound {
            kind: "revision",
            id: "42".to_string(),
        }
        .into();

        assert!(matches!(err, CheckoutError::NotFound { kind: "revision", ref id } if id == "42"));
        assert!(err.is_user_error());
        assert_eq!(err.to_string(), "revision 42 not found");
    }

    #[test]
    fn test_backend_failures_are_not_user_errors() {
        let err: CheckoutError = StoreError::Backend("disk full".to_string()).into();
        assert!(matches!(err, CheckoutError::Store(_)));
        assert!(!err.is_user_error());
    }
}
