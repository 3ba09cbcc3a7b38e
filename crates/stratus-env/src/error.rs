//! Error types for the stratus-env crate

use std::time::Duration;
use stratus_store::StoreError;
use thiserror::Error;

/// Result type alias using `EnvError`
pub type Result<T> = std::result::Result<T, EnvError>;

/// Errors surfaced to the storage engine
#[derive(Error, Debug)]
pub enum EnvError {
    /// File, object or key is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote or local call failed for a reason other than absence
    #[error("io error: {0}")]
    Io(String),

    /// Policy or option violation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation cannot be expressed on the backing store
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Retry budget exhausted
    #[error("{operation} timed out after {waited:?}")]
    TimedOut { operation: String, waited: Duration },

    /// The log tailer stopped on an unrecoverable stream error
    #[error("log tailer failed: {0}")]
    TailerFailed(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EnvError {
    /// Whether the error means the addressed thing does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether retrying an idempotent call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Whether the error is latched and must never be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TailerFailed(_))
    }
}

impl From<StoreError> for EnvError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            EnvError::NotFound(err.to_string())
        } else {
            EnvError::Io(err.to_string())
        }
    }
}

impl From<std::io::Error> for EnvError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            EnvError::NotFound(err.to_string())
        } else {
            EnvError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        EnvError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_translate_at_boundary() {
        let err: EnvError = StoreError::no_such_key("b", "k").into();
        assert!(err.is_not_found());

        let err: EnvError = StoreError::Unavailable("throttled".into()).into();
        assert!(err.is_transient());

        let err: EnvError = StoreError::InvalidRange { offset: 9, size: 1 }.into();
        assert!(matches!(err, EnvError::Io(_)));
    }

    #[test]
    fn test_io_not_found_is_not_transient() {
        let err: EnvError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }
}
