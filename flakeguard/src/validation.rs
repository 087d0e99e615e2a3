//! Policy validation reports
//!
//! Errors reject a configuration write; warnings are returned alongside
//! the saved policy.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Outcome of validating a policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Record an error unless `value` lies in `[min, max]`
    pub fn require_range(&mut self, field: &str, value: f64, min: f64, max: f64) {
        if !(min..=max).contains(&value) {
            self.error(format!(
                "{} must be between {} and {} (got {})",
                field, min, max, value
            ));
        }
    }

    /// Record an error unless `value >= 1`
    pub fn require_positive(&mut self, field: &str, value: u64) {
        if value < 1 {
            self.error(format!("{} must be at least 1", field));
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert to the write result: `Err` when any error was recorded
    pub fn into_result(self) -> Result<Vec<String>, PolicyError> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(PolicyError::Invalid(self.errors))
        }
    }
}

/// A policy accepted by a configuration write, with non-fatal warnings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPolicy<P> {
    pub policy: P,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_and_positive_checks() {
        let mut report = ValidationReport::new();
        report.require_range("rate", 0.5, 0.0, 1.0);
        report.require_positive("runs", 3);
        assert!(report.is_valid());

        report.require_range("rate", 1.5, 0.0, 1.0);
        report.require_range("nan", f64::NAN, 0.0, 1.0);
        report.require_positive("runs", 0);
        assert_eq!(report.errors.len(), 3);
        assert!(report.errors[0].starts_with("rate must be between"));
    }

    #[test]
    fn test_into_result() {
        let mut report = ValidationReport::new();
        report.warn("low threshold");
        assert_eq!(report.clone().into_result(), Ok(vec!["low threshold".to_string()]));

        report.error("bad");
        assert_eq!(
            report.into_result(),
            Err(PolicyError::Invalid(vec!["bad".to_string()]))
        );
    }
}
