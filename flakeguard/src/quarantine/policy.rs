//! Per-project quarantine thresholds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::PolicyId;

/// Name keywords that mark a test as high impact regardless of policy lists
pub const HIGH_IMPACT_KEYWORDS: &[&str] = &["critical", "smoke", "integration", "e2e", "sanity"];

/// Quarantine thresholds for one project.
///
/// At most one policy per project is active; projects without one fall back
/// to [`QuarantinePolicy::builtin`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantinePolicy {
    pub id: PolicyId,
    pub project_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // Quarantine thresholds
    pub failure_rate_threshold: f64,
    pub confidence_threshold: f64,
    pub consecutive_failures_threshold: u32,
    pub min_runs: u32,

    // Unquarantine thresholds
    pub stability_period_days: u32,
    pub success_rate_required: f64,
    pub min_successful_runs: u32,

    /// Upper bound, in percent, on the share of a project's tests in quarantine
    pub max_quarantine_percentage: f64,

    pub high_impact_suites: Vec<String>,
    pub priority_tests: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for QuarantinePolicy {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            project_id: String::new(),
            name: "default".to_string(),
            description: None,
            failure_rate_threshold: 0.6,
            confidence_threshold: 0.7,
            consecutive_failures_threshold: 3,
            min_runs: 5,
            stability_period_days: 7,
            success_rate_required: 0.95,
            min_successful_runs: 10,
            max_quarantine_percentage: 20.0,
            high_impact_suites: Vec::new(),
            priority_tests: Vec::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl QuarantinePolicy {
    /// Built-in defaults for a project without a configured policy
    pub fn builtin(project_id: &str) -> Self {
        Self {
            id: format!("builtin:{}", project_id),
            project_id: project_id.to_string(),
            name: "built-in defaults".to_string(),
            ..Self::default()
        }
    }

    /// New named policy with default thresholds and a fresh id
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether a test blocks critical paths
    pub fn is_high_impact(&self, test_name: &str, test_suite: Option<&str>) -> bool {
        if let Some(suite) = test_suite {
            if self.high_impact_suites.iter().any(|s| s == suite) {
                return true;
            }
        }
        if self.priority_tests.iter().any(|t| t == test_name) {
            return true;
        }
        let lower = test_name.to_lowercase();
        HIGH_IMPACT_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    /// Consecutive passes needed before unquarantine
    pub fn required_consecutive_successes(&self) -> u32 {
        (self.min_successful_runs / 2).min(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults_match_rule_constants() {
        let policy = QuarantinePolicy::builtin("proj");
        assert_eq!(policy.failure_rate_threshold, 0.6);
        assert_eq!(policy.confidence_threshold, 0.7);
        assert_eq!(policy.consecutive_failures_threshold, 3);
        assert_eq!(policy.min_runs, 5);
        assert_eq!(policy.id, "builtin:proj");
    }

    #[test]
    fn test_high_impact_detection() {
        let mut policy = QuarantinePolicy::builtin("proj");
        policy.high_impact_suites = vec!["checkout".into()];
        policy.priority_tests = vec!["test_login".into()];

        assert!(policy.is_high_impact("anything", Some("checkout")));
        assert!(policy.is_high_impact("test_login", None));
        assert!(policy.is_high_impact("test_Smoke_homepage", None));
        assert!(policy.is_high_impact("e2e_signup", Some("web")));
        assert!(!policy.is_high_impact("test_parse_date", Some("utils")));
    }

    #[test]
    fn test_required_consecutive_successes() {
        let mut policy = QuarantinePolicy::builtin("proj");
        policy.min_successful_runs = 10;
        assert_eq!(policy.required_consecutive_successes(), 5);
        policy.min_successful_runs = 20;
        assert_eq!(policy.required_consecutive_successes(), 5);
        policy.min_successful_runs = 3;
        assert_eq!(policy.required_consecutive_successes(), 1);
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let policy: QuarantinePolicy =
            serde_json::from_str(r#"{"project_id":"p","failure_rate_threshold":0.5}"#).unwrap();
        assert_eq!(policy.failure_rate_threshold, 0.5);
        assert_eq!(policy.stability_period_days, 7);
    }
}
