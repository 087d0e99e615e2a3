//! Retry engine: per-failure decision across prioritized policies
//!
//! ```text
//! failure ─▶ policies (priority desc) ─▶ per policy:
//!   1. attempt ≥ max_retries        ─▶ Block
//!   2. circuit breaker admits?      ─▶ Block (open / saturated)
//!   3. budget remaining?            ─▶ Block (exhausted)
//!   4. time windows permit?         ─▶ Skip
//!   5. all conditions match?        ─▶ Skip
//!   6. only_flaky satisfied?        ─▶ Skip
//!   7. reserve probe, backoff delay ─▶ Approve
//! ```
//!
//! A Block stops evaluation and surfaces its reason; a Skip moves on to the
//! next policy. State store failures never deny a retry: the evaluation
//! proceeds as if the breaker were closed and the budget unused, and the
//! failure is reported as a warning on the [`Degraded`] result.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::backoff::BackoffCalculator;
use super::budget::BudgetStatus;
use super::circuit_breaker::{CircuitBreakerState, CircuitState};
use super::conditions::{first_unmatched, window_permits, ConditionContext};
use super::policy::RetryPolicy;
use super::state_store::RetryStateStore;
use crate::degraded::Degraded;
use crate::state::schema::keys;
use crate::state::{StoreResult, TestIdentity};

/// Flaky classification of the failing test, as last committed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlakyStatus {
    pub is_flaky: bool,
    pub confidence: f64,
    pub failure_rate: f64,
}

/// One failure offered for retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRequest {
    pub project_id: String,
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suite: Option<String>,
    /// Retries already performed for this failure (0 for the first failure)
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Filled from the committed pattern when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flaky: Option<FlakyStatus>,
}

impl RetryRequest {
    pub fn new(project_id: impl Into<String>, test_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            project_id: project_id.into(),
            test_name: test_name.into(),
            test_suite: None,
            attempt,
            error_text: None,
            context: HashMap::new(),
            flaky: None,
        }
    }

    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.test_suite = Some(suite.into());
        self
    }

    pub fn with_error(mut self, error_text: impl Into<String>) -> Self {
        self.error_text = Some(error_text.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_flaky(mut self, flaky: FlakyStatus) -> Self {
        self.flaky = Some(flaky);
        self
    }

    pub fn identity(&self) -> TestIdentity {
        let identity = TestIdentity::new(self.project_id.clone(), self.test_name.clone());
        match &self.test_suite {
            Some(suite) => identity.with_suite(suite.clone()),
            None => identity,
        }
    }
}

/// Outcome of a retry evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: String,
    /// Attempt number of the approved retry (request attempt + 1)
    pub retry_attempt: u32,
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Policy that approved or blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Flaky confidence of the test, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_state: Option<CircuitState>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl RetryDecision {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            reason: reason.into(),
            retry_attempt: 0,
            delay_ms: 0,
            next_retry_at: None,
            policy_id: None,
            confidence: None,
            budget: None,
            breaker_state: None,
            metadata: HashMap::new(),
        }
    }

    fn by_policy(mut self, policy: &RetryPolicy) -> Self {
        self.policy_id = Some(policy.id.clone());
        self
    }
}

/// Verdict of a single policy
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyVerdict {
    /// Retry approved by this policy
    Approve(RetryDecision),
    /// Explicit denial; lower-priority policies are not consulted
    Block(RetryDecision),
    /// Policy does not apply to this failure
    Skip(String),
}

/// Pick the decision from policies already in evaluation order.
///
/// The first Approve or Block wins. When every policy skips, the denial
/// lists each skip reason under `metadata.skipped`.
pub fn arbitrate_policies<'p, I, F>(policies: I, mut evaluate: F) -> RetryDecision
where
    I: IntoIterator<Item = &'p RetryPolicy>,
    F: FnMut(&'p RetryPolicy) -> PolicyVerdict,
{
    let mut skipped = Vec::new();
    for policy in policies {
        match evaluate(policy) {
            PolicyVerdict::Approve(decision) | PolicyVerdict::Block(decision) => return decision,
            PolicyVerdict::Skip(reason) => skipped.push(json!({
                "policy_id": policy.id,
                "reason": reason,
            })),
        }
    }
    if skipped.is_empty() {
        return RetryDecision::denied("No active retry policies");
    }
    let mut decision = RetryDecision::denied("No matching retry policy");
    decision.metadata.insert("skipped".to_string(), Value::Array(skipped));
    decision
}

/// Sort active policies for `project_id` by descending priority, then id
pub fn ordered_policies<'p>(policies: &'p [RetryPolicy], project_id: &str) -> Vec<&'p RetryPolicy> {
    let mut ordered: Vec<_> = policies.iter().filter(|p| p.applies_to(project_id)).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    ordered
}

pub struct RetryEngine {
    state: Arc<dyn RetryStateStore>,
    backoff: BackoffCalculator,
}

impl RetryEngine {
    pub fn new(state: Arc<dyn RetryStateStore>) -> Self {
        Self {
            state,
            backoff: BackoffCalculator::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffCalculator) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide whether `request` is retried under `policies`
    pub fn evaluate(
        &self,
        policies: &[RetryPolicy],
        request: &RetryRequest,
        now: DateTime<Utc>,
    ) -> Degraded<RetryDecision> {
        let identity = request.identity();
        let mut warnings = Vec::new();
        let ordered = ordered_policies(policies, &request.project_id);
        let mut decision = arbitrate_policies(ordered, |policy| {
            self.evaluate_policy(policy, request, &identity, now, &mut warnings)
        });
        decision.confidence = request.flaky.map(|f| f.confidence);
        if !decision.should_retry {
            debug!(
                project = %request.project_id,
                test = %request.test_name,
                attempt = request.attempt,
                reason = %decision.reason,
                "Retry denied"
            );
        }

        let mut result = Degraded::full(decision);
        for warning in warnings {
            result.degrade(warning);
        }
        result
    }

    fn evaluate_policy(
        &self,
        policy: &RetryPolicy,
        request: &RetryRequest,
        identity: &TestIdentity,
        now: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> PolicyVerdict {
        // 1. Attempt limit
        if request.attempt >= policy.max_retries {
            return PolicyVerdict::Block(
                RetryDecision::denied(format!(
                    "Max retries exceeded ({} of {})",
                    request.attempt, policy.max_retries
                ))
                .by_policy(policy),
            );
        }

        // 2. Circuit breaker
        let breaker_key = keys::breaker(&policy.id, identity);
        let mut breaker_state = None;
        if policy.circuit_breaker.enabled {
            let mut admitted = Ok(());
            let result = self.state.update_breaker(&breaker_key, &mut |cb| {
                admitted = cb.admit(&policy.circuit_breaker, now);
                breaker_state = Some(cb.state);
            });
            if let Err(e) = result {
                warnings.push(format!("circuit breaker {} unreadable: {}", breaker_key, e));
            }
            if let Err(reason) = admitted {
                let mut decision = RetryDecision::denied(reason).by_policy(policy);
                decision.breaker_state = breaker_state;
                return PolicyVerdict::Block(decision);
            }
        }

        // 3. Budget
        let mut budget = None;
        if let Some(limits) = policy.retry_budget {
            let key = keys::budget(&policy.id, &request.project_id);
            let result = self.state.update_budget(&key, now, &mut |b| {
                budget = Some(b.check(&limits, now));
            });
            if let Err(e) = result {
                warnings.push(format!("retry budget {} unreadable: {}", key, e));
            }
            if let Some(status) = budget.filter(|s| !s.allowed) {
                let mut decision = RetryDecision::denied(format!(
                    "Retry budget exhausted ({} of {} hourly, {} of {} daily remaining)",
                    status.hourly_remaining,
                    limits.max_per_hour,
                    status.daily_remaining,
                    limits.max_per_day
                ))
                .by_policy(policy);
                decision.budget = Some(status);
                decision.breaker_state = breaker_state;
                return PolicyVerdict::Block(decision);
            }
        }

        // 4. Time windows
        if let Err(reason) = window_permits(&policy.time_windows, now) {
            return PolicyVerdict::Skip(reason);
        }

        // 5. Conditions
        let ctx = ConditionContext {
            test_name: &request.test_name,
            error_text: request.error_text.as_deref(),
            failure_rate: request.flaky.map(|f| f.failure_rate),
            context: &request.context,
            now,
        };
        if let Some(condition) = first_unmatched(&policy.conditions, &ctx) {
            return PolicyVerdict::Skip(format!(
                "Condition not met: {} {} {}",
                condition.kind, condition.operator, condition.value
            ));
        }

        // 6. Flaky-only policies
        if policy.only_flaky_tests {
            match request.flaky {
                Some(f) if f.is_flaky && f.confidence >= policy.confidence_threshold => {}
                Some(f) if f.is_flaky => {
                    return PolicyVerdict::Skip(format!(
                        "Flaky confidence {:.2} below threshold {:.2}",
                        f.confidence, policy.confidence_threshold
                    ))
                }
                _ => return PolicyVerdict::Skip("Test is not classified as flaky".to_string()),
            }
        }

        // 7. Approve, claiming a half-open probe if needed
        if policy.circuit_breaker.enabled && breaker_state == Some(CircuitState::HalfOpen) {
            let mut reserved = true;
            let result = self.state.update_breaker(&breaker_key, &mut |cb| {
                reserved = cb.reserve_probe(&policy.circuit_breaker);
                breaker_state = Some(cb.state);
            });
            if let Err(e) = result {
                warnings.push(format!("circuit breaker {} probe not recorded: {}", breaker_key, e));
            }
            if !reserved {
                let mut decision = RetryDecision::denied("Circuit breaker half-open, saturated")
                    .by_policy(policy);
                decision.breaker_state = breaker_state;
                return PolicyVerdict::Block(decision);
            }
        }

        let retry_attempt = request.attempt + 1;
        let delay_ms = self.backoff.delay_ms(&policy.backoff, retry_attempt);
        let next_retry_at = i64::try_from(delay_ms)
            .ok()
            .and_then(|ms| now.checked_add_signed(Duration::milliseconds(ms)));
        let mut decision = RetryDecision {
            should_retry: true,
            reason: format!(
                "Retry {} of {} approved by policy '{}'",
                retry_attempt, policy.max_retries, policy.name
            ),
            retry_attempt,
            delay_ms,
            next_retry_at,
            policy_id: None,
            confidence: None,
            budget,
            breaker_state,
            metadata: HashMap::new(),
        }
        .by_policy(policy);
        decision
            .metadata
            .insert("backoff".to_string(), json!(policy.backoff.strategy));
        PolicyVerdict::Approve(decision)
    }

    /// Consume budget for a retry that was actually dispatched
    pub fn record_dispatched(
        &self,
        policy: &RetryPolicy,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> Degraded<Option<BudgetStatus>> {
        let Some(limits) = policy.retry_budget else {
            return Degraded::full(None);
        };
        let key = keys::budget(&policy.id, project_id);
        let mut status = None;
        let result = self.state.update_budget(&key, now, &mut |b| {
            b.consume(now);
            status = Some(b.status(&limits));
        });
        let mut degraded = Degraded::full(status);
        degraded.check("retry budget consumption", result);
        degraded
    }

    /// Feed a retry outcome into the breaker for (policy, test)
    pub fn report_outcome(
        &self,
        policy: &RetryPolicy,
        identity: &TestIdentity,
        success: bool,
        now: DateTime<Utc>,
    ) -> Degraded<Option<CircuitBreakerState>> {
        let key = keys::breaker(&policy.id, identity);
        let mut snapshot = None;
        let result = self.state.update_breaker(&key, &mut |cb| {
            let before = cb.state;
            cb.record_outcome(&policy.circuit_breaker, success, now);
            if before != cb.state {
                debug!(key = %key, from = %before, to = %cb.state, "Circuit breaker transition");
            }
            snapshot = Some(cb.clone());
        });
        let mut degraded = Degraded::full(snapshot);
        degraded.check("circuit breaker update", result);
        degraded
    }

    pub fn breaker_state(
        &self,
        policy_id: &str,
        identity: &TestIdentity,
    ) -> StoreResult<Option<CircuitBreakerState>> {
        self.state.breaker(&keys::breaker(policy_id, identity))
    }

    /// Budget as seen at `now`, without consuming or persisting resets
    pub fn budget_status(
        &self,
        policy: &RetryPolicy,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<BudgetStatus>> {
        let Some(limits) = policy.retry_budget else {
            return Ok(None);
        };
        let stored = self.state.budget(&keys::budget(&policy.id, project_id))?;
        Ok(stored.map(|mut b| b.check(&limits, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::backoff::{BackoffConfig, FixedRandom};
    use crate::retry::policy::{
        CircuitBreakerConfig, ConditionKind, ConditionOperator, RetryBudgetLimits,
        RetryCondition, TimeWindow, WindowAction,
    };
    use crate::retry::state_store::InMemoryRetryState;
    use chrono::TimeZone;

    fn engine() -> RetryEngine {
        RetryEngine::new(InMemoryRetryState::new().shared())
            .with_backoff(BackoffCalculator::new(Arc::new(FixedRandom(0.5))))
    }

    fn t0() -> DateTime<Utc> {
        // Tuesday
        Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap()
    }

    fn policy(name: &str, priority: i32) -> RetryPolicy {
        RetryPolicy::new(name)
            .with_priority(priority)
            .with_backoff(BackoffConfig::exponential(1000, 2.0))
    }

    #[test]
    fn test_no_policies() {
        let d = engine().evaluate(&[], &RetryRequest::new("p", "t", 0), t0());
        assert!(!d.value.should_retry);
        assert_eq!(d.value.reason, "No active retry policies");
    }

    #[test]
    fn test_exponential_delays_then_max_retries() {
        let engine = engine();
        let policies = vec![policy("default", 0).with_max_retries(3)];
        let delays: Vec<u64> = (0..3)
            .map(|attempt| {
                let d = engine.evaluate(&policies, &RetryRequest::new("p", "t", attempt), t0());
                assert!(d.value.should_retry, "{}", d.value.reason);
                assert_eq!(d.value.retry_attempt, attempt + 1);
                d.value.delay_ms
            })
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);

        let fourth = engine.evaluate(&policies, &RetryRequest::new("p", "t", 3), t0());
        assert!(!fourth.value.should_retry);
        assert!(fourth.value.reason.contains("Max retries exceeded"));
    }

    #[test]
    fn test_next_retry_at_follows_delay() {
        let policies = vec![policy("default", 0)];
        let d = engine().evaluate(&policies, &RetryRequest::new("p", "t", 1), t0());
        assert_eq!(d.value.next_retry_at, Some(t0() + Duration::milliseconds(2000)));
    }

    #[test]
    fn test_skip_falls_through_to_lower_priority() {
        let network_only = policy("network", 10).with_condition(RetryCondition::new(
            ConditionKind::ErrorPattern,
            ConditionOperator::Contains,
            json!("ECONNRESET"),
        ));
        let fallback = policy("fallback", 1).with_max_retries(1);
        let fallback_id = fallback.id.clone();
        let request = RetryRequest::new("p", "t", 0).with_error("assertion failed");
        let d = engine().evaluate(&[network_only, fallback], &request, t0());
        assert!(d.value.should_retry);
        assert_eq!(d.value.policy_id, Some(fallback_id));
    }

    #[test]
    fn test_block_stops_evaluation() {
        let strict = policy("strict", 10).with_max_retries(1);
        let strict_id = strict.id.clone();
        let lenient = policy("lenient", 1).with_max_retries(10);
        let d = engine().evaluate(&[lenient, strict], &RetryRequest::new("p", "t", 1), t0());
        assert!(!d.value.should_retry);
        assert_eq!(d.value.policy_id, Some(strict_id));
    }

    #[test]
    fn test_all_skipped_lists_reasons() {
        let flaky_only = policy("flaky", 5).only_flaky(0.8);
        let request = RetryRequest::new("p", "t", 0).with_flaky(FlakyStatus {
            is_flaky: true,
            confidence: 0.6,
            failure_rate: 0.3,
        });
        let d = engine().evaluate(&[flaky_only], &request, t0()).into_value();
        assert_eq!(d.reason, "No matching retry policy");
        let skipped = d.metadata["skipped"].as_array().unwrap();
        assert!(skipped[0]["reason"].as_str().unwrap().contains("below threshold"));
    }

    #[test]
    fn test_blackout_window_skips() {
        let night = policy("night", 0).with_time_window(TimeWindow::new(
            "11:00",
            "13:00",
            WindowAction::Deny,
        ));
        let d = engine().evaluate(&[night], &RetryRequest::new("p", "t", 0), t0());
        assert!(!d.value.should_retry);
        assert_eq!(d.value.reason, "No matching retry policy");
    }

    #[test]
    fn test_breaker_opens_then_admits_one_probe() {
        let engine = engine();
        let p = policy("cb", 0)
            .with_max_retries(10)
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 30_000,
                ..CircuitBreakerConfig::default()
            });
        let request = RetryRequest::new("p", "t", 0);
        let identity = request.identity();
        let policies = vec![p.clone()];

        engine.report_outcome(&p, &identity, false, t0());
        engine.report_outcome(&p, &identity, false, t0());
        let denied = engine.evaluate(&policies, &request, t0() + Duration::seconds(1));
        assert!(!denied.value.should_retry);
        assert!(denied.value.reason.contains("open"));
        assert_eq!(denied.value.breaker_state, Some(CircuitState::Open));

        let later = t0() + Duration::seconds(30);
        let probe = engine.evaluate(&policies, &request, later);
        assert!(probe.value.should_retry);
        assert_eq!(probe.value.breaker_state, Some(CircuitState::HalfOpen));
        let second = engine.evaluate(&policies, &request, later);
        assert!(!second.value.should_retry);
        assert!(second.value.reason.contains("saturated"));

        engine.report_outcome(&p, &identity, true, later);
        let state = engine.breaker_state(&p.id, &identity).unwrap().unwrap();
        assert_eq!(state.state, CircuitState::Closed);
        assert!(engine.evaluate(&policies, &request, later).value.should_retry);
    }

    #[test]
    fn test_budget_consumed_only_on_dispatch() {
        let engine = engine();
        let p = policy("budgeted", 0).with_budget(RetryBudgetLimits::new(2, 10));
        let policies = vec![p.clone()];
        let request = RetryRequest::new("p", "t", 0);

        for _ in 0..5 {
            assert!(engine.evaluate(&policies, &request, t0()).value.should_retry);
        }
        engine.record_dispatched(&p, "p", t0());
        engine.record_dispatched(&p, "p", t0());
        let denied = engine.evaluate(&policies, &request, t0()).into_value();
        assert!(!denied.should_retry);
        assert!(denied.reason.contains("budget exhausted"));
        assert_eq!(denied.budget.unwrap().daily_remaining, 8);

        let status = engine
            .budget_status(&p, "p", t0() + Duration::hours(1))
            .unwrap()
            .unwrap();
        assert!(status.allowed);
        assert_eq!(status.hourly_used, 0);
    }

    #[test]
    fn test_disabled_breaker_creates_no_state() {
        let state = InMemoryRetryState::new().shared();
        let engine = RetryEngine::new(state.clone());
        let p = policy("off", 0).with_circuit_breaker(CircuitBreakerConfig::disabled());
        engine.evaluate(&[p], &RetryRequest::new("p", "t", 0), t0());
        assert_eq!(state.breaker_count(), 0);
    }

    #[test]
    fn test_project_scoped_policy_ignored_elsewhere() {
        let scoped = policy("web-only", 0).for_project("web");
        let d = engine().evaluate(&[scoped], &RetryRequest::new("api", "t", 0), t0());
        assert_eq!(d.value.reason, "No active retry policies");
    }
}
