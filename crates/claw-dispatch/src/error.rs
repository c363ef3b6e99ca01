//! Error types for the claw-dispatch crate.

use thiserror::Error;

/// Errors raised while loading or validating a configuration.
///
/// All of these are fatal at load time: a reload that hits one of them is
/// rejected and the running configuration stays in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A label matcher could not be built.
    #[error("invalid matcher for label '{label}': {reason}")]
    InvalidMatcher {
        /// The label the matcher applies to.
        label: String,
        /// Why the matcher is invalid.
        reason: String,
    },

    /// A route references a receiver that is not defined.
    #[error("route references unknown receiver: {name}")]
    UnknownReceiver {
        /// The undefined receiver name.
        name: String,
    },

    /// Two receivers share a name.
    #[error("duplicate receiver: {name}")]
    DuplicateReceiver {
        /// The duplicated receiver name.
        name: String,
    },

    /// Any other structural problem with the document.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// The reason the configuration is invalid.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors reported by the external stores (alerts, silences, notification log).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached right now.
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// The reason the store is unavailable.
        reason: String,
    },

    /// The requested entry does not exist.
    #[error("not found: {id}")]
    NotFound {
        /// The identifier that was not found.
        id: String,
    },

    /// The store refused a write.
    #[error("rejected: {reason}")]
    Rejected {
        /// Why the write was refused.
        reason: String,
    },
}

/// Errors produced by notification pipeline stages and integrations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    /// A transient failure, safe to retry (timeouts, 5xx responses).
    #[error("{integration}: retryable failure: {reason}")]
    Retryable {
        /// The integration that failed.
        integration: String,
        /// The reason for the failure.
        reason: String,
    },

    /// A failure that will not go away by retrying (bad payload, 4xx responses).
    #[error("{integration}: permanent failure: {reason}")]
    Permanent {
        /// The integration that failed.
        integration: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Some integrations of a receiver failed.
    #[error("receiver {receiver}: {} of {total} integrations failed", failures.len())]
    Partial {
        /// The receiver whose fanout failed.
        receiver: String,
        /// Total number of integrations attempted.
        total: usize,
        /// The individual failures.
        failures: Vec<NotifyError>,
    },

    /// The retry budget ran out.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<NotifyError>,
    },

    /// The router has no notifier registered under this receiver name.
    #[error("no notifier registered for receiver: {name}")]
    UnknownReceiver {
        /// The receiver name.
        name: String,
    },
}

impl NotifyError {
    /// Creates a retryable error.
    pub fn retryable(integration: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Retryable {
            integration: integration.into(),
            reason: reason.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(integration: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            integration: integration.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if another attempt could succeed.
    ///
    /// A partial fanout failure is retryable as long as at least one of its
    /// failures is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable { .. } => true,
            Self::Partial { failures, .. } => failures.iter().any(Self::is_retryable),
            Self::Permanent { .. } | Self::RetriesExhausted { .. } | Self::UnknownReceiver { .. } => {
                false
            }
        }
    }
}

/// Top-level error type for the crate.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A notification failed.
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_matcher() {
        let err = ConfigError::InvalidMatcher {
            label: "job".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid matcher for label 'job': unclosed group"
        );
    }

    #[test]
    fn error_display_unknown_receiver() {
        let err = ConfigError::UnknownReceiver {
            name: "pager".to_string(),
        };
        assert_eq!(err.to_string(), "route references unknown receiver: pager");
    }

    #[test]
    fn error_display_store_unavailable() {
        let err = StoreError::Unavailable {
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "store unavailable: connection refused");
    }

    #[test]
    fn error_display_retryable() {
        let err = NotifyError::retryable("webhook/0", "timeout");
        assert_eq!(err.to_string(), "webhook/0: retryable failure: timeout");
    }

    #[test]
    fn error_display_partial() {
        let err = NotifyError::Partial {
            receiver: "team-a".to_string(),
            total: 3,
            failures: vec![NotifyError::retryable("webhook/1", "timeout")],
        };
        assert_eq!(
            err.to_string(),
            "receiver team-a: 1 of 3 integrations failed"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(NotifyError::retryable("w", "x").is_retryable());
        assert!(!NotifyError::permanent("w", "x").is_retryable());
        assert!(!NotifyError::RetriesExhausted {
            attempts: 3,
            last: Box::new(NotifyError::retryable("w", "x")),
        }
        .is_retryable());
    }

    #[test]
    fn partial_is_retryable_if_any_failure_is() {
        let mixed = NotifyError::Partial {
            receiver: "r".to_string(),
            total: 2,
            failures: vec![
                NotifyError::permanent("a", "bad request"),
                NotifyError::retryable("b", "timeout"),
            ],
        };
        assert!(mixed.is_retryable());

        let permanent = NotifyError::Partial {
            receiver: "r".to_string(),
            total: 1,
            failures: vec![NotifyError::permanent("a", "bad request")],
        };
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("invalid json");
        assert!(json_err.is_err());
        let err: ConfigError = json_err.unwrap_err().into();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn dispatch_error_wraps_config() {
        let err: DispatchError = ConfigError::Invalid {
            reason: "empty".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "invalid configuration: empty");
    }
}
