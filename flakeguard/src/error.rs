//! Crate-level error types
//!
//! Runtime decisions (retry, quarantine) never surface these: they return
//! decision values with a reason. Errors are reserved for configuration
//! writes, config loading and direct store access.

use thiserror::Error;

use crate::retry::formula::FormulaError;
use crate::state::StoreError;

/// Result type alias for flakeguard operations
pub type FlakeguardResult<T> = Result<T, FlakeguardError>;

/// Rejection of a policy write
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Invalid policy: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Policy not found: {0}")]
    NotFound(String),
}

/// Failure to load configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum FlakeguardError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_joins_messages() {
        let err = PolicyError::Invalid(vec!["a out of range".into(), "b < 1".into()]);
        assert_eq!(err.to_string(), "Invalid policy: a out of range; b < 1");
    }

    #[test]
    fn test_store_error_wraps() {
        let err: FlakeguardError = StoreError::LockPoisoned.into();
        assert_eq!(err.to_string(), "Store error: Lock poisoned");
    }
}
