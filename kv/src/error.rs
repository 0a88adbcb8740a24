//! KV store error types

use thiserror::Error;

/// Errors surfaced by any [`Kv`](crate::Kv) implementation
#[derive(Debug, Error)]
pub enum KvError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("value for key {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("subscription channel closed")]
    SubscriptionClosed,
}

impl KvError {
    /// Whether the operation may succeed if retried against the same store.
    ///
    /// Unreachable errors are what trips the failover path; backend errors
    /// (wrong type, protocol) will not heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Unreachable(_))
    }
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() || e.is_io_error() {
            KvError::Unreachable(e.to_string())
        } else {
            KvError::Backend(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_is_transient() {
        assert!(KvError::Unreachable("connection refused".to_string()).is_transient());
        assert!(!KvError::Backend("WRONGTYPE".to_string()).is_transient());
        assert!(
            !KvError::NotAnInteger {
                key: "ratelimit:render:u1".to_string()
            }
            .is_transient()
        );
    }
}
