//! Error types for sc-agent.

use thiserror::Error;

/// Error taxonomy shared across the daemon.
///
/// The distinction between `InvalidChecksum` / `Parse` (invalid data,
/// never retried, cache untouched) and `Http` / `Io` (transient,
/// retried by the owning loop) is load-bearing: callers branch on it.
#[derive(Error, Debug)]
pub enum ScError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("checksum mismatch for {id}: expected {expected}, got {actual}")]
    InvalidChecksum {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid storage URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("secret store error: {0}")]
    Store(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("component disabled: {0}")]
    Disabled(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("post-hook failures: {0}")]
    Hooks(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScError {
    /// Invalid-data errors are terminal for the current cycle: the
    /// owning loop must not retry them and must not touch its cache.
    pub fn is_invalid_data(&self) -> bool {
        matches!(
            self,
            ScError::Parse(_) | ScError::InvalidChecksum { .. } | ScError::InvalidUri { .. }
        )
    }

    /// Fatal errors abort startup or trigger graceful shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScError::Config(_) | ScError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_is_invalid_data() {
        let err = ScError::InvalidChecksum {
            id: "item".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_invalid_data());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_auth_is_fatal() {
        assert!(ScError::Auth("login rejected".into()).is_fatal());
        assert!(!ScError::Http("timeout".into()).is_fatal());
    }
}
