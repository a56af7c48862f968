//! Error types for the Gatekeeper service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A route asked for an operation class with no registered policy
    #[error("No rate limit policy registered for operation class '{0}'")]
    UnknownPolicy(String),

    /// A policy failed validation while loading
    #[error("Invalid policy for operation class '{class}': {reason}")]
    InvalidPolicy { class: String, reason: String },

    /// A client key string could not be parsed
    #[error("Invalid client key: {0}")]
    InvalidClientKey(String),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(String),

    /// An operation did not finish within its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Audit sink errors
    #[error("Audit error: {0}")]
    Audit(String),

    /// Metrics could not be rendered
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Caller identity could not be resolved
    #[error("Identity resolution error: {0}")]
    Identity(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error points at a deployment or configuration bug.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UnknownPolicy(_) | Self::InvalidPolicy { .. }
        )
    }

    /// Whether this error is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Timeout(_))
    }
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatekeeperError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GatekeeperError::UnknownPolicy("x".into()).is_configuration());
        assert!(!GatekeeperError::UnknownPolicy("x".into()).is_transient());
        assert!(GatekeeperError::Timeout(Duration::from_millis(50)).is_transient());
        assert!(GatekeeperError::Store("down".into()).is_transient());
        assert!(!GatekeeperError::Audit("disk full".into()).is_configuration());
    }

    #[test]
    fn test_unknown_policy_message() {
        let err = GatekeeperError::UnknownPolicy("write".into());
        assert_eq!(
            err.to_string(),
            "No rate limit policy registered for operation class 'write'"
        );
    }
}
