//! Engine configuration
//!
//! Built from defaults, then an optional TOML file, then `FLAKEGUARD_*`
//! environment overrides. Unparsable environment values are ignored.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Flaky classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Groups with fewer non-skipped runs are not classified
    pub min_runs: u32,
    /// Minimum failure rate to call a test flaky
    pub flaky_threshold: f64,
    /// Minimum confidence to call a test flaky
    pub confidence_threshold: f64,
    /// History window considered by each analysis
    pub lookback_days: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_runs: 5,
            flaky_threshold: 0.15,
            confidence_threshold: 0.7,
            lookback_days: 30,
        }
    }
}

/// Quarantine engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineEngineConfig {
    /// Number of most recent runs used for rapid-degradation detection
    pub recent_window: usize,
}

impl Default for QuarantineEngineConfig {
    fn default() -> Self {
        Self { recent_window: 10 }
    }
}

/// Background sweep intervals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub classification_interval_secs: u64,
    pub unquarantine_interval_secs: u64,
}

impl SweepConfig {
    pub fn classification_interval(&self) -> Duration {
        Duration::from_secs(self.classification_interval_secs.max(1))
    }

    pub fn unquarantine_interval(&self) -> Duration {
        Duration::from_secs(self.unquarantine_interval_secs.max(1))
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            classification_interval_secs: 3600,
            unquarantine_interval_secs: 6 * 3600,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlakeguardConfig {
    pub classifier: ClassifierConfig,
    pub quarantine: QuarantineEngineConfig,
    pub sweep: SweepConfig,
}

impl FlakeguardConfig {
    /// Defaults with environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_with(|key| std::env::var(key).ok());
        config
    }

    /// Parse a TOML file (missing sections fall back to defaults)
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Optional file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `FLAKEGUARD_*` overrides from an arbitrary lookup
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(n) = parsed(&lookup, "FLAKEGUARD_MIN_RUNS") {
            self.classifier.min_runs = n;
        }
        if let Some(v) = parsed(&lookup, "FLAKEGUARD_FLAKY_THRESHOLD") {
            self.classifier.flaky_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "FLAKEGUARD_CONFIDENCE_THRESHOLD") {
            self.classifier.confidence_threshold = v;
        }
        if let Some(n) = parsed(&lookup, "FLAKEGUARD_LOOKBACK_DAYS") {
            self.classifier.lookback_days = n;
        }
        if let Some(n) = parsed(&lookup, "FLAKEGUARD_RECENT_WINDOW") {
            self.quarantine.recent_window = n;
        }
        if let Some(n) = parsed(&lookup, "FLAKEGUARD_CLASSIFY_INTERVAL_SECS") {
            self.sweep.classification_interval_secs = n;
        }
        if let Some(n) = parsed(&lookup, "FLAKEGUARD_UNQUARANTINE_INTERVAL_SECS") {
            self.sweep.unquarantine_interval_secs = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = FlakeguardConfig::default();
        assert_eq!(config.classifier.min_runs, 5);
        assert_eq!(config.classifier.flaky_threshold, 0.15);
        assert_eq!(config.classifier.confidence_threshold, 0.7);
        assert_eq!(config.quarantine.recent_window, 10);
    }

    #[test]
    fn test_env_overrides_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("FLAKEGUARD_MIN_RUNS", "8"),
            ("FLAKEGUARD_FLAKY_THRESHOLD", "not-a-number"),
            ("FLAKEGUARD_CLASSIFY_INTERVAL_SECS", " 60 "),
        ]
        .into_iter()
        .collect();
        let mut config = FlakeguardConfig::default();
        config.apply_env_with(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.classifier.min_runs, 8);
        assert_eq!(config.classifier.flaky_threshold, 0.15);
        assert_eq!(config.sweep.classification_interval_secs, 60);
    }

    #[test]
    fn test_partial_toml() {
        let config = FlakeguardConfig::from_toml_str(
            r#"
[classifier]
min_runs = 12

[sweep]
unquarantine_interval_secs = 120
"#,
        )
        .unwrap();
        assert_eq!(config.classifier.min_runs, 12);
        assert_eq!(config.classifier.lookback_days, 30);
        assert_eq!(config.sweep.unquarantine_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_toml_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            FlakeguardConfig::from_toml_file(&missing),
            Err(ConfigError::Io { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "classifier = 3").unwrap();
        assert!(matches!(
            FlakeguardConfig::from_toml_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
