//! Error types for the discovery engine

use thiserror::Error;

/// Discovery error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Zero candidates left after status and filter checks. The only
    /// error class the resolver retries.
    #[error("No available instances for service {0}")]
    NoAvailableInstances(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Produced inside the health supervisor only; surfaces as a status
    /// transition, never to resolve callers.
    #[error("Probe failure: {0}")]
    Probe(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether a resolve attempt that failed with this error may be retried
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoAvailableInstances(_))
    }

    /// Wrap a persistence failure, keeping the cause in the message
    pub fn store(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::Store(format!("{context}: {cause}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::store("redis", err)
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_empty_candidates_are_retryable() {
        assert!(Error::NoAvailableInstances("api".to_string()).is_retryable());
        assert!(!Error::Timeout("resolve".to_string()).is_retryable());
        assert!(!Error::Store("down".to_string()).is_retryable());
        assert!(!Error::NotFound("api-1".to_string()).is_retryable());
    }

    #[test]
    fn test_store_error_keeps_cause() {
        let err = Error::store("save instance api-1", "connection refused");
        assert_eq!(
            err.to_string(),
            "Store error: save instance api-1: connection refused"
        );
    }
}
