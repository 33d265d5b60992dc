//! Error types for anvilq operations.

use thiserror::Error;

/// Result type used throughout anvilq.
pub type AnvilResult<T> = Result<T, AnvilError>;

/// Main error type for anvilq operations.
#[derive(Error, Debug)]
pub enum AnvilError {
    /// A work action reported a failure
    #[error("Action failed: {message}")]
    ActionFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Enqueue on a stopped queue that does not reclaim
    #[error("Work queue '{queue}' is not running")]
    NotRunning {
        /// Name of the queue that rejected the item
        queue: String,
    },

    /// The queue has been disposed and accepts no further work
    #[error("Work queue '{queue}' has been disposed")]
    Disposed {
        /// Name of the disposed queue
        queue: String,
    },

    /// A previous engine did not retire within the bounded wait
    #[error("Operation timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AnvilError {
    /// Create an action failure without an underlying error
    pub fn action(message: impl Into<String>) -> Self {
        Self::ActionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an action failure wrapping an underlying error
    pub fn action_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ActionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    pub(crate) fn not_running(queue: &str) -> Self {
        Self::NotRunning {
            queue: queue.to_string(),
        }
    }

    pub(crate) fn disposed(queue: &str) -> Self {
        Self::Disposed {
            queue: queue.to_string(),
        }
    }

    /// Whether this error means the target queue was torn down.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AnvilError::not_running("mail");
        assert_eq!(err.to_string(), "Work queue 'mail' is not running");

        let err = AnvilError::config("name must not be empty");
        assert!(err.to_string().contains("name must not be empty"));
    }

    #[test]
    fn test_action_error_keeps_source() {
        let io = std::io::Error::other("disk full");
        let err = AnvilError::action_with("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_disposed());
        assert!(AnvilError::disposed("q").is_disposed());
    }
}
