//! Quarantine Engine: quarantine / unquarantine state machine per pattern
//!
//! ```text
//! unquarantined ──(rule fires | manual)──▶ quarantined
//!       ▲                                     │
//!       └──(stability criteria | manual)──────┘
//! ```
//!
//! The decision functions ([`QuarantineEngine::decide`],
//! [`QuarantineEngine::assess_stability`]) are pure. The transition
//! functions load state, decide, and apply the transition through the
//! store's atomic check-and-set, so two concurrent evaluations can never
//! both quarantine the same pattern. Write failures after a decision are
//! reported on the [`Degraded`] wrapper instead of discarding the decision.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::policy::QuarantinePolicy;
use super::rules::{EvaluationSnapshot, RuleSet};
use crate::classifier::stats::{self, RunCounts};
use crate::config::QuarantineEngineConfig;
use crate::degraded::Degraded;
use crate::state::{
    FlakyTestPattern, ImpactWindow, PatternStore, QuarantineAction, QuarantineHistoryEntry,
    QuarantineMark, RunHistory, RunOutcome, StoreResult, TestIdentity, TriggeredBy,
};

/// Ephemeral result of a quarantine evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineDecision {
    pub should_quarantine: bool,
    pub reason: String,
    pub confidence: f64,
    pub impact_score: f64,
    /// Winning rule, when a rule fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// The pattern was already quarantined; nothing was evaluated
    pub already_quarantined: bool,
    /// Whether this call performed the transition
    pub transitioned: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QuarantineDecision {
    fn no_action(reason: impl Into<String>) -> Self {
        Self {
            should_quarantine: false,
            reason: reason.into(),
            confidence: 0.0,
            impact_score: 0.0,
            rule: None,
            already_quarantined: false,
            transitioned: false,
            metadata: HashMap::new(),
        }
    }

    fn already_quarantined() -> Self {
        Self {
            already_quarantined: true,
            ..Self::no_action("Already quarantined")
        }
    }
}

/// Stability assessment of a quarantined pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnquarantineEvaluation {
    pub should_unquarantine: bool,
    pub reason: String,
    pub success_rate: f64,
    pub consecutive_successes: u32,
    pub days_since_quarantine: f64,
    pub total_recent_runs: u32,
    pub stability_score: f64,
    /// Whether this call performed the transition
    pub transitioned: bool,
}

impl UnquarantineEvaluation {
    fn not_quarantined() -> Self {
        Self {
            should_unquarantine: false,
            reason: "Not quarantined".to_string(),
            success_rate: 0.0,
            consecutive_successes: 0,
            days_since_quarantine: 0.0,
            total_recent_runs: 0,
            stability_score: 0.0,
            transitioned: false,
        }
    }
}

/// Quarantine rule engine bound to a history provider and a pattern store
pub struct QuarantineEngine {
    rules: RuleSet,
    config: QuarantineEngineConfig,
    lookback_days: u32,
    history: Arc<dyn RunHistory>,
    patterns: Arc<dyn PatternStore>,
}

impl QuarantineEngine {
    pub fn new(
        config: QuarantineEngineConfig,
        lookback_days: u32,
        history: Arc<dyn RunHistory>,
        patterns: Arc<dyn PatternStore>,
    ) -> Self {
        Self {
            rules: RuleSet::standard(),
            config,
            lookback_days,
            history,
            patterns,
        }
    }

    /// Replace the rule registry
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Runs considered by quarantine evaluation at `now`, oldest first
    pub fn lookback_runs(
        &self,
        identity: &TestIdentity,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RunOutcome>> {
        let since = now - Duration::days(i64::from(self.lookback_days));
        self.history.find_run_outcomes(identity, since)
    }

    /// Runs since a pattern was quarantined, oldest first
    pub fn runs_since_quarantine(
        &self,
        pattern: &FlakyTestPattern,
    ) -> StoreResult<Vec<RunOutcome>> {
        match pattern.quarantined_at {
            Some(at) => self.history.find_run_outcomes(&pattern.identity, at),
            None => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Pure decisions
    // =========================================================================

    /// Evaluate the rules for a pattern given its recent runs (oldest first)
    pub fn decide(
        &self,
        pattern: &FlakyTestPattern,
        runs: &[RunOutcome],
        policy: &QuarantinePolicy,
    ) -> QuarantineDecision {
        if pattern.is_quarantined {
            return QuarantineDecision::already_quarantined();
        }

        let recent = stats::recent_runs(runs, self.config.recent_window);
        let recent_failed = recent.iter().filter(|r| r.is_failure()).count();
        let recent_failure_rate = if recent.is_empty() {
            0.0
        } else {
            recent_failed as f64 / recent.len() as f64
        };
        let identity = &pattern.identity;
        let snapshot = EvaluationSnapshot {
            identity,
            failure_rate: pattern.failure_rate,
            confidence: pattern.confidence,
            total_runs: pattern.total_runs,
            consecutive_failures: stats::trailing_failures(runs),
            recent_failure_rate,
            recent_samples: recent.len(),
            is_high_impact: policy
                .is_high_impact(&identity.test_name, identity.test_suite.as_deref()),
            policy,
        };

        match self.rules.decide(&snapshot) {
            Some(outcome) => {
                let mut metadata = HashMap::new();
                metadata.insert("rule".to_string(), json!(outcome.rule));
                metadata.insert("failure_rate".to_string(), json!(pattern.failure_rate));
                metadata.insert("total_runs".to_string(), json!(pattern.total_runs));
                metadata.insert(
                    "consecutive_failures".to_string(),
                    json!(snapshot.consecutive_failures),
                );
                metadata.insert("high_impact".to_string(), json!(snapshot.is_high_impact));
                metadata.insert("policy_id".to_string(), json!(policy.id));
                QuarantineDecision {
                    should_quarantine: true,
                    reason: outcome.reason,
                    confidence: outcome.confidence,
                    impact_score: outcome.impact_score,
                    rule: Some(outcome.rule),
                    already_quarantined: false,
                    transitioned: false,
                    metadata,
                }
            }
            None => QuarantineDecision::no_action("No quarantine rule fired"),
        }
    }

    /// Assess whether a quarantined pattern has stabilized.
    ///
    /// `runs_since` are the runs since `quarantined_at`, oldest first.
    pub fn assess_stability(
        pattern: &FlakyTestPattern,
        runs_since: &[RunOutcome],
        policy: &QuarantinePolicy,
        now: DateTime<Utc>,
    ) -> UnquarantineEvaluation {
        let Some(quarantined_at) = pattern.quarantined_at.filter(|_| pattern.is_quarantined)
        else {
            return UnquarantineEvaluation::not_quarantined();
        };

        let counts = RunCounts::of(runs_since);
        let success_rate = counts.success_rate();
        let consecutive_successes = stats::trailing_successes(runs_since);
        let days_since_quarantine =
            (now - quarantined_at).num_seconds().max(0) as f64 / 86_400.0;
        let stability_ratio = if policy.stability_period_days == 0 {
            1.0
        } else {
            days_since_quarantine / policy.stability_period_days as f64
        };
        let stability_score = (success_rate
            + consecutive_successes as f64 / 10.0
            + stability_ratio * 0.2)
            .min(1.0);

        let required_streak = policy.required_consecutive_successes();
        let mut unmet = Vec::new();
        if days_since_quarantine < policy.stability_period_days as f64 {
            unmet.push(format!(
                "{:.1} of {} stability days elapsed",
                days_since_quarantine, policy.stability_period_days
            ));
        }
        if success_rate < policy.success_rate_required {
            unmet.push(format!(
                "success rate {:.0}% below {:.0}%",
                success_rate * 100.0,
                policy.success_rate_required * 100.0
            ));
        }
        if counts.total < policy.min_successful_runs {
            unmet.push(format!(
                "{} of {} required runs",
                counts.total, policy.min_successful_runs
            ));
        }
        if consecutive_successes < required_streak {
            unmet.push(format!(
                "{} of {} consecutive successes",
                consecutive_successes, required_streak
            ));
        }

        let should_unquarantine = unmet.is_empty();
        let reason = if should_unquarantine {
            format!(
                "Stable for {:.1} days: {:.0}% success over {} runs, {} consecutive passes",
                days_since_quarantine,
                success_rate * 100.0,
                counts.total,
                consecutive_successes
            )
        } else {
            format!("Not yet stable: {}", unmet.join(", "))
        };

        UnquarantineEvaluation {
            should_unquarantine,
            reason,
            success_rate,
            consecutive_successes,
            days_since_quarantine,
            total_recent_runs: counts.total,
            stability_score,
            transitioned: false,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Evaluate quarantine for an identity and apply the transition if a rule fires
    pub fn evaluate_quarantine(
        &self,
        identity: &TestIdentity,
        policy: &QuarantinePolicy,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Degraded<QuarantineDecision> {
        let pattern = match self.patterns.get_pattern(identity) {
            Ok(Some(pattern)) => pattern,
            Ok(None) => {
                return Degraded::full(QuarantineDecision::no_action(
                    "No flaky pattern recorded for test",
                ))
            }
            Err(e) => {
                return Degraded::unavailable(
                    QuarantineDecision::no_action("Pattern state unavailable"),
                    format!("load pattern for {}: {}", identity, e),
                )
            }
        };
        if pattern.is_quarantined {
            return Degraded::full(QuarantineDecision::already_quarantined());
        }

        let (runs, read_warning) = match self.lookback_runs(identity, now) {
            Ok(runs) => (runs, None),
            Err(e) => (Vec::new(), Some(format!("load run history: {}", e))),
        };

        let decision = self.decide(&pattern, &runs, policy);
        let mut result = Degraded::full(decision);
        if let Some(warning) = read_warning {
            result.degrade(warning);
        }
        if !result.value.should_quarantine {
            debug!(test = %identity, reason = %result.value.reason, "Quarantine not warranted");
            return result;
        }

        let reason = result.value.reason.clone();
        let metadata = result.value.metadata.clone();
        self.apply_quarantine(identity, &reason, triggered_by, metadata, now, &mut result);
        result
    }

    /// Quarantine regardless of rules (manual override)
    pub fn quarantine_manually(
        &self,
        identity: &TestIdentity,
        user: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Degraded<QuarantineDecision> {
        let existing = match self.patterns.get_pattern(identity) {
            Ok(existing) => existing,
            Err(e) => {
                return Degraded::unavailable(
                    QuarantineDecision::no_action("Pattern state unavailable"),
                    format!("load pattern for {}: {}", identity, e),
                )
            }
        };
        let mut result = Degraded::full(QuarantineDecision {
            should_quarantine: true,
            confidence: 1.0,
            rule: Some("manual".to_string()),
            ..QuarantineDecision::no_action(reason)
        });
        match existing {
            Some(pattern) if pattern.is_quarantined => {
                return Degraded::full(QuarantineDecision::already_quarantined());
            }
            Some(_) => {}
            None => {
                let empty = FlakyTestPattern::empty(identity.clone(), now);
                if let Err(e) = self.patterns.upsert_pattern_stats(&empty) {
                    result.degrade(format!("create pattern for {}: {}", identity, e));
                    return result;
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("manual".to_string(), json!(true));
        self.apply_quarantine(
            identity,
            reason,
            TriggeredBy::user(user),
            metadata,
            now,
            &mut result,
        );
        result
    }

    fn apply_quarantine(
        &self,
        identity: &TestIdentity,
        reason: &str,
        triggered_by: TriggeredBy,
        metadata: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
        result: &mut Degraded<QuarantineDecision>,
    ) {
        let mark = QuarantineMark {
            at: now,
            by: triggered_by.to_string(),
            reason: reason.to_string(),
        };
        match self.patterns.try_quarantine(identity, &mark) {
            Ok(true) => {
                result.value.transitioned = true;
                info!(test = %identity, by = %triggered_by, reason, "Test quarantined");
                let entry = QuarantineHistoryEntry::new(
                    identity.clone(),
                    QuarantineAction::Quarantined,
                    reason,
                    triggered_by,
                    now,
                )
                .with_metadata(metadata);
                result.check("append quarantine history", self.patterns.append_history(&entry));
                result.check(
                    "open impact window",
                    self.patterns
                        .open_impact_window(&ImpactWindow::open(identity.clone(), now)),
                );
            }
            Ok(false) => {
                // Lost the race to a concurrent quarantine
                result.value = QuarantineDecision::already_quarantined();
            }
            Err(e) => result.degrade(format!("quarantine {}: {}", identity, e)),
        }
    }

    /// Assess a quarantined identity and unquarantine it when stable
    pub fn evaluate_unquarantine(
        &self,
        identity: &TestIdentity,
        policy: &QuarantinePolicy,
        triggered_by: TriggeredBy,
        now: DateTime<Utc>,
    ) -> Degraded<UnquarantineEvaluation> {
        let pattern = match self.patterns.get_pattern(identity) {
            Ok(Some(pattern)) => pattern,
            Ok(None) => return Degraded::full(UnquarantineEvaluation::not_quarantined()),
            Err(e) => {
                return Degraded::unavailable(
                    UnquarantineEvaluation::not_quarantined(),
                    format!("load pattern for {}: {}", identity, e),
                )
            }
        };
        if !pattern.is_quarantined || pattern.quarantined_at.is_none() {
            return Degraded::full(UnquarantineEvaluation::not_quarantined());
        }

        let runs = match self.runs_since_quarantine(&pattern) {
            Ok(runs) => runs,
            Err(e) => {
                let mut eval = Self::assess_stability(&pattern, &[], policy, now);
                eval.should_unquarantine = false;
                eval.reason = "Run history unavailable".to_string();
                return Degraded::unavailable(eval, format!("load run history: {}", e));
            }
        };

        let mut result = Degraded::full(Self::assess_stability(&pattern, &runs, policy, now));
        if result.value.should_unquarantine {
            let reason = result.value.reason.clone();
            let mut metadata = HashMap::new();
            metadata.insert("success_rate".to_string(), json!(result.value.success_rate));
            metadata.insert(
                "stability_score".to_string(),
                json!(result.value.stability_score),
            );
            metadata.insert(
                "days_since_quarantine".to_string(),
                json!(result.value.days_since_quarantine),
            );
            let transitioned =
                self.apply_unquarantine(identity, &reason, triggered_by, metadata, now, &mut result);
            result.value.transitioned = transitioned;
        }
        result
    }

    /// Unquarantine regardless of stability (manual override or scheduler)
    pub fn unquarantine(
        &self,
        identity: &TestIdentity,
        triggered_by: TriggeredBy,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Degraded<bool> {
        let mut result = Degraded::full(false);
        let transitioned =
            self.apply_unquarantine(identity, reason, triggered_by, HashMap::new(), now, &mut result);
        result.value = transitioned;
        result
    }

    fn apply_unquarantine<T>(
        &self,
        identity: &TestIdentity,
        reason: &str,
        triggered_by: TriggeredBy,
        metadata: HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
        result: &mut Degraded<T>,
    ) -> bool {
        match self.patterns.try_unquarantine(identity) {
            Ok(true) => {
                info!(test = %identity, by = %triggered_by, reason, "Test unquarantined");
                let entry = QuarantineHistoryEntry::new(
                    identity.clone(),
                    QuarantineAction::Unquarantined,
                    reason,
                    triggered_by,
                    now,
                )
                .with_metadata(metadata);
                result.check("append quarantine history", self.patterns.append_history(&entry));
                if let Err(e) = self.patterns.close_impact_window(identity, now) {
                    result.degrade(format!("close impact window: {}", e));
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                result.degrade(format!("unquarantine {}: {}", identity, e));
                false
            }
        }
    }
}
