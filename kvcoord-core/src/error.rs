//! Error types for client operations

use std::error::Error as StdError;

use thiserror::Error;

use crate::codec::CodecError;
use crate::store::StoreError;

/// Boxed error returned by caller-supplied transforms
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for client operations
pub type KvResult<T> = Result<T, KvError>;

/// Errors returned by the client
#[derive(Error, Debug)]
pub enum KvError {
    /// The cancellation token fired; wins over every other outcome
    #[error("operation cancelled")]
    Cancelled,

    /// Store call failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Value could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transform refused the update
    #[error("transform failed for {key}: {source}")]
    Transform {
        key: String,
        #[source]
        source: BoxError,
    },

    /// Every attempt lost to a concurrent writer
    #[error("failed to CAS {key} after {attempts} attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    /// The store returned something the client cannot interpret
    #[error("unexpected store response: {0}")]
    UnexpectedResponse(String),
}

impl KvError {
    /// True for errors a later attempt could clear
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Store(_) | KvError::Transform { .. })
    }
}

/// Error signalled by a transform, tagged with whether retrying may help
#[derive(Debug)]
pub struct TransformError {
    retryable: bool,
    source: BoxError,
}

impl TransformError {
    /// Fail this attempt but let the CAS loop try again
    pub fn retry(source: impl Into<BoxError>) -> Self {
        TransformError { retryable: true, source: source.into() }
    }

    /// Fail the whole CAS call
    pub fn abort(source: impl Into<BoxError>) -> Self {
        TransformError { retryable: false, source: source.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub(crate) fn into_kv_error(self, key: &str) -> KvError {
        KvError::Transform { key: key.to_string(), source: self.source }
    }
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::RetriesExhausted { key: "cfg".to_string(), attempts: 3 };
        assert_eq!(err.to_string(), "failed to CAS cfg after 3 attempts");

        let err: KvError = StoreError::Unavailable("down".to_string()).into();
        assert_eq!(err.to_string(), "store error: store unavailable: down");
        assert!(err.is_transient());
    }

    #[test]
    fn test_transform_error() {
        let err = TransformError::abort("ring is full");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "ring is full");

        let kv = err.into_kv_error("ring");
        assert_eq!(kv.to_string(), "transform failed for ring: ring is full");
        assert!(StdError::source(&kv).is_some());

        assert!(TransformError::retry("busy").is_retryable());
    }
}
