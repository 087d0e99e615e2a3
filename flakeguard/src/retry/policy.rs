//! Retry policy records
//!
//! Policies are evaluated in descending `priority`; ties break on id so
//! evaluation order is stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::formula::Formula;
use crate::state::PolicyId;
use crate::validation::ValidationReport;

pub use super::backoff::{BackoffConfig, BackoffStrategy, JitterKind};
pub use super::budget::RetryBudgetLimits;
pub use super::circuit_breaker::CircuitBreakerConfig;
pub use super::conditions::{
    ConditionKind, ConditionOperator, RetryCondition, TimeWindow, WindowAction,
};

/// Upper bound on `max_retries`
pub const MAX_RETRIES_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub id: PolicyId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Restrict to one project; `None` applies everywhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub priority: i32,
    pub is_active: bool,

    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub conditions: Vec<RetryCondition>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub time_windows: Vec<TimeWindow>,

    /// Retry only tests currently classified flaky
    pub only_flaky_tests: bool,
    /// Minimum flaky confidence when `only_flaky_tests` is set
    pub confidence_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_budget: Option<RetryBudgetLimits>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: "default".to_string(),
            description: None,
            project_id: None,
            priority: 0,
            is_active: true,
            max_retries: 3,
            backoff: BackoffConfig::default(),
            conditions: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            time_windows: Vec::new(),
            only_flaky_tests: false,
            confidence_threshold: 0.7,
            retry_budget: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_windows.push(window);
        self
    }

    pub fn with_budget(mut self, limits: RetryBudgetLimits) -> Self {
        self.retry_budget = Some(limits);
        self
    }

    pub fn only_flaky(mut self, confidence_threshold: f64) -> Self {
        self.only_flaky_tests = true;
        self.confidence_threshold = confidence_threshold;
        self
    }

    /// Whether the policy is active and covers `project_id`
    pub fn applies_to(&self, project_id: &str) -> bool {
        self.is_active
            && self
                .project_id
                .as_deref()
                .map_or(true, |p| p == project_id)
    }

    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();
        if self.name.trim().is_empty() {
            report.error("name must not be empty");
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            report.error(format!(
                "max_retries must be at most {} (got {})",
                MAX_RETRIES_LIMIT, self.max_retries
            ));
        }

        let backoff = &self.backoff;
        if let Some(max) = backoff.max_delay_ms {
            if max < backoff.base_delay_ms {
                report.error(format!(
                    "backoff.max_delay_ms ({}) is below base_delay_ms ({})",
                    max, backoff.base_delay_ms
                ));
            }
        }
        if !(backoff.multiplier > 0.0 && backoff.multiplier.is_finite()) {
            report.error("backoff.multiplier must be a positive number");
        }
        if backoff.strategy == BackoffStrategy::Custom {
            match backoff.formula.as_deref() {
                Some(source) => {
                    if let Err(e) = Formula::parse(source) {
                        report.error(format!("backoff.formula does not parse: {}", e));
                    }
                }
                None => report.error("custom backoff requires a formula"),
            }
        }

        for problem in self.conditions.iter().flat_map(RetryCondition::problems) {
            report.error(problem);
        }
        for problem in self.time_windows.iter().flat_map(TimeWindow::problems) {
            report.error(problem);
        }
        for problem in self.circuit_breaker.problems() {
            report.error(problem);
        }
        if let Some(budget) = &self.retry_budget {
            for problem in budget.problems() {
                report.error(problem);
            }
            if budget.max_per_day < budget.max_per_hour {
                report.warn("retry_budget.max_per_day is below max_per_hour");
            }
        }
        report.require_range("confidence_threshold", self.confidence_threshold, 0.0, 1.0);

        if self.max_retries > 10 {
            report.warn("max_retries above 10 can hide real failures");
        }
        if !self.circuit_breaker.enabled {
            report.warn("circuit breaker disabled");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_policy_is_valid() {
        let report = RetryPolicy::new("default").validate();
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let policy = RetryPolicy::new("broken")
            .with_max_retries(101)
            .with_backoff(BackoffConfig::custom(1000, "attempt *").with_max_delay_ms(10))
            .with_condition(RetryCondition::new(
                ConditionKind::ErrorPattern,
                ConditionOperator::Regex,
                json!("[a-"),
            ))
            .with_time_window(TimeWindow::new("25:00", "06:00", WindowAction::Allow))
            .with_budget(RetryBudgetLimits::new(0, 10))
            .only_flaky(1.5);
        let errors = policy.validate().errors;
        assert_eq!(errors.len(), 7, "{:#?}", errors);
    }

    #[test]
    fn test_deeply_nested_formula_is_rejected() {
        let formula = format!("{}attempt{}", "(".repeat(200_000), ")".repeat(200_000));
        let policy = RetryPolicy::new("deep").with_backoff(BackoffConfig::custom(100, formula));
        let report = policy.validate();
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("backoff.formula does not parse"));

        let nested = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        let policy = RetryPolicy::new("deep").with_backoff(BackoffConfig::custom(100, nested));
        assert!(!policy.validate().is_valid());
    }

    #[test]
    fn test_multiplier_must_be_positive() {
        let policy = RetryPolicy::new("p").with_backoff(BackoffConfig::exponential(100, 0.0));
        assert!(!policy.validate().is_valid());
    }

    #[test]
    fn test_applies_to_project_scope() {
        let global = RetryPolicy::new("global");
        let scoped = RetryPolicy::new("scoped").for_project("web");
        assert!(global.applies_to("api"));
        assert!(scoped.applies_to("web"));
        assert!(!scoped.applies_to("api"));
        let mut inactive = RetryPolicy::new("off");
        inactive.is_active = false;
        assert!(!inactive.applies_to("api"));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let policy: RetryPolicy = serde_json::from_value(json!({
            "id": "flaky-net",
            "name": "Network flakes",
            "priority": 10,
            "max_retries": 2,
            "backoff": { "strategy": "linear", "base_delay_ms": 500 },
            "conditions": [
                { "type": "error_pattern", "operator": "contains", "value": "ECONNRESET" }
            ],
            "retry_budget": { "max_per_hour": 20, "max_per_day": 100 }
        }))
        .unwrap();
        assert_eq!(policy.backoff.strategy, BackoffStrategy::Linear);
        assert_eq!(policy.backoff.multiplier, 2.0);
        assert!(policy.circuit_breaker.enabled);
        assert!(policy.validate().is_valid());
    }
}
