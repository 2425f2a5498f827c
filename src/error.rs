//! Error types for keyrate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for keyrate operations.
#[derive(Error, Debug)]
pub enum KeyrateError {
    /// The requested operations would push the bucket past its burst ceiling.
    #[error("Rate limit exceeded for {key}")]
    LimitExceeded { key: String },

    /// The backing store could not run the check
    #[error("Backend unavailable: {0}")]
    Backend(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeyrateError {
    /// Whether this is a rejection rather than an operational failure.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, KeyrateError::LimitExceeded { .. })
    }
}

/// Result type alias for keyrate operations.
pub type Result<T> = std::result::Result<T, KeyrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_is_distinguishable() {
        let rejected = KeyrateError::LimitExceeded {
            key: "ratelimit:user".to_string(),
        };
        assert!(rejected.is_limit_exceeded());

        let backend = KeyrateError::from(StoreError::Unavailable("connection refused".into()));
        assert!(!backend.is_limit_exceeded());
        assert!(!KeyrateError::Config("missing rate".into()).is_limit_exceeded());
    }

    #[test]
    fn test_backend_error_message_is_preserved() {
        let err = KeyrateError::from(StoreError::Unavailable("connection refused".into()));
        assert_eq!(
            err.to_string(),
            "Backend unavailable: Store unavailable: connection refused"
        );
    }
}
