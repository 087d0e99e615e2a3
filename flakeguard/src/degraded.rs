//! Degraded results: decisions that survive persistence failures
//!
//! A quarantine or retry decision is never aborted because a write failed.
//! Instead the decision is wrapped with a degradation level and warnings so
//! the caller still receives it and can surface the degraded write.
//!
//! ```text
//! decide
//!   ├─ reads + writes succeed  → Degraded { level: Full, ... }
//!   ├─ decided, write failed   → Degraded { level: Partial, warnings, ... }
//!   └─ state unreadable        → Degraded { level: Unavailable, value: no-op, ... }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How much of the operation's state handling succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Decision made and all writes committed.
    Full,
    /// Decision made, but at least one write failed.
    Partial,
    /// Stored state could not be read; the value is a safe no-op.
    Unavailable,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A value wrapped with degradation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degraded<T> {
    pub value: T,
    pub level: DegradationLevel,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> Degraded<T> {
    pub fn full(value: T) -> Self {
        Self {
            value,
            level: DegradationLevel::Full,
            warnings: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Safe fallback value when state could not be read
    pub fn unavailable(value: T, warning: impl Into<String>) -> Self {
        let warning = warning.into();
        warn!(warning = %warning, "Decision made without stored state");
        Self {
            value,
            level: DegradationLevel::Unavailable,
            warnings: vec![warning],
            timestamp: Utc::now(),
        }
    }

    /// Record a failed write; downgrades `Full` to `Partial`
    pub fn degrade(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        warn!(warning = %warning, "Degraded write");
        if self.level == DegradationLevel::Full {
            self.level = DegradationLevel::Partial;
        }
        self.warnings.push(warning);
    }

    /// Record the error of a write, if it failed
    pub fn check<E: std::fmt::Display>(&mut self, what: &str, result: Result<(), E>) {
        if let Err(e) = result {
            self.degrade(format!("{} failed: {}", what, e));
        }
    }

    pub fn is_full(&self) -> bool {
        self.level == DegradationLevel::Full
    }

    pub fn is_degraded(&self) -> bool {
        self.level != DegradationLevel::Full
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Degraded<U> {
        Degraded {
            value: f(self.value),
            level: self.level,
            warnings: self.warnings,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_response() {
        let resp = Degraded::full(42);
        assert!(resp.is_full());
        assert!(!resp.is_degraded());
        assert!(resp.warnings.is_empty());
    }

    #[test]
    fn test_degrade_downgrades_once() {
        let mut resp = Degraded::full("decision");
        resp.check::<String>("append history", Ok(()));
        assert!(resp.is_full());
        resp.check("append history", Err("disk full"));
        resp.degrade("second failure");
        assert_eq!(resp.level, DegradationLevel::Partial);
        assert_eq!(resp.warnings.len(), 2);
        assert_eq!(resp.warnings[0], "append history failed: disk full");
    }

    #[test]
    fn test_unavailable_stays_unavailable() {
        let mut resp = Degraded::unavailable(false, "store down");
        resp.degrade("also failed");
        assert_eq!(resp.level, DegradationLevel::Unavailable);
    }

    #[test]
    fn test_level_ordering() {
        assert!(DegradationLevel::Full < DegradationLevel::Partial);
        assert!(DegradationLevel::Partial < DegradationLevel::Unavailable);
    }

    #[test]
    fn test_map_preserves_warnings() {
        let mut resp = Degraded::full(2);
        resp.degrade("w");
        let mapped = resp.map(|v| v * 10);
        assert_eq!(mapped.value, 20);
        assert_eq!(mapped.warnings, vec!["w".to_string()]);
    }
}
