//! Quarantine rules and arbitration
//!
//! Each rule is a pure function of an [`EvaluationSnapshot`]. Rules are
//! evaluated in registry order; among the rules that fire, the one with the
//! highest resulting confidence wins, and ties go to the earlier rule.

use serde::{Deserialize, Serialize};

use super::policy::QuarantinePolicy;
use crate::state::TestIdentity;

/// Everything a rule may look at
#[derive(Debug, Clone)]
pub struct EvaluationSnapshot<'a> {
    pub identity: &'a TestIdentity,
    pub failure_rate: f64,
    pub confidence: f64,
    pub total_runs: u32,
    /// Failures counted back from the most recent run
    pub consecutive_failures: u32,
    /// Failure rate over the most recent runs
    pub recent_failure_rate: f64,
    /// Number of runs in the recent window
    pub recent_samples: usize,
    pub is_high_impact: bool,
    pub policy: &'a QuarantinePolicy,
}

/// Verdict of a single rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule: String,
    pub should_quarantine: bool,
    pub reason: String,
    pub confidence: f64,
    pub impact_score: f64,
}

impl RuleOutcome {
    fn pass(rule: &str) -> Self {
        Self {
            rule: rule.to_string(),
            should_quarantine: false,
            reason: String::new(),
            confidence: 0.0,
            impact_score: 0.0,
        }
    }

    fn fire(rule: &str, reason: String, confidence: f64, impact_score: f64) -> Self {
        Self {
            rule: rule.to_string(),
            should_quarantine: true,
            reason,
            confidence: confidence.clamp(0.0, 1.0),
            impact_score,
        }
    }
}

/// A single quarantine rule
pub trait QuarantineRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, snapshot: &EvaluationSnapshot<'_>) -> RuleOutcome;
}

/// Fires on a sustained high failure rate
#[derive(Debug, Clone, Copy, Default)]
pub struct HighFailureRate;

impl QuarantineRule for HighFailureRate {
    fn name(&self) -> &'static str {
        "high_failure_rate"
    }

    fn evaluate(&self, s: &EvaluationSnapshot<'_>) -> RuleOutcome {
        let policy = s.policy;
        if s.failure_rate >= policy.failure_rate_threshold
            && s.confidence >= policy.confidence_threshold
            && s.total_runs >= policy.min_runs
        {
            let multiplier = if s.is_high_impact { 2.0 } else { 1.0 };
            RuleOutcome::fire(
                self.name(),
                format!(
                    "High failure rate {:.0}% over {} runs (confidence {:.2})",
                    s.failure_rate * 100.0,
                    s.total_runs,
                    s.confidence
                ),
                s.confidence,
                s.failure_rate * multiplier,
            )
        } else {
            RuleOutcome::pass(self.name())
        }
    }
}

/// Fires on a streak of failures at the head of the history
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsecutiveFailures;

impl ConsecutiveFailures {
    const MIN_CONFIDENCE: f64 = 0.6;
}

impl QuarantineRule for ConsecutiveFailures {
    fn name(&self) -> &'static str {
        "consecutive_failures"
    }

    fn evaluate(&self, s: &EvaluationSnapshot<'_>) -> RuleOutcome {
        if s.consecutive_failures >= s.policy.consecutive_failures_threshold
            && s.confidence >= Self::MIN_CONFIDENCE
        {
            let boosted = (s.confidence + 0.1 * s.consecutive_failures as f64).min(1.0);
            let multiplier = if s.is_high_impact { 1.5 } else { 1.0 };
            RuleOutcome::fire(
                self.name(),
                format!("{} consecutive failures", s.consecutive_failures),
                boosted,
                s.consecutive_failures as f64 * 0.3 * multiplier,
            )
        } else {
            RuleOutcome::pass(self.name())
        }
    }
}

/// Fires when a high-impact test fails often enough to threaten critical paths
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticalPathImpact;

impl CriticalPathImpact {
    const MIN_FAILURE_RATE: f64 = 0.4;
    const MIN_CONFIDENCE: f64 = 0.5;
}

impl QuarantineRule for CriticalPathImpact {
    fn name(&self) -> &'static str {
        "critical_path_impact"
    }

    fn evaluate(&self, s: &EvaluationSnapshot<'_>) -> RuleOutcome {
        if s.is_high_impact
            && s.failure_rate >= Self::MIN_FAILURE_RATE
            && s.confidence >= Self::MIN_CONFIDENCE
        {
            RuleOutcome::fire(
                self.name(),
                format!(
                    "High-impact test failing {:.0}% of runs",
                    s.failure_rate * 100.0
                ),
                s.confidence * 1.2,
                s.failure_rate * 3.0,
            )
        } else {
            RuleOutcome::pass(self.name())
        }
    }
}

/// Fires when recent runs fail markedly more often than the long-run rate
#[derive(Debug, Clone, Copy, Default)]
pub struct RapidDegradation;

impl RapidDegradation {
    const DEGRADATION_FACTOR: f64 = 1.5;
    const MIN_SAMPLES: usize = 3;
    const MIN_CONFIDENCE: f64 = 0.5;
}

impl QuarantineRule for RapidDegradation {
    fn name(&self) -> &'static str {
        "rapid_degradation"
    }

    fn evaluate(&self, s: &EvaluationSnapshot<'_>) -> RuleOutcome {
        if s.recent_samples >= Self::MIN_SAMPLES
            && s.recent_failure_rate > 0.0
            && s.recent_failure_rate > Self::DEGRADATION_FACTOR * s.failure_rate
            && s.confidence >= Self::MIN_CONFIDENCE
        {
            RuleOutcome::fire(
                self.name(),
                format!(
                    "Recent failure rate {:.0}% vs {:.0}% overall",
                    s.recent_failure_rate * 100.0,
                    s.failure_rate * 100.0
                ),
                s.confidence,
                s.recent_failure_rate * 2.0,
            )
        } else {
            RuleOutcome::pass(self.name())
        }
    }
}

/// Ordered rule registry
pub struct RuleSet {
    rules: Vec<Box<dyn QuarantineRule>>,
}

impl RuleSet {
    /// The four standard rules in priority order
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Box::new(HighFailureRate),
                Box::new(ConsecutiveFailures),
                Box::new(CriticalPathImpact),
                Box::new(RapidDegradation),
            ],
        }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule at the lowest priority
    pub fn with_rule(mut self, rule: impl QuarantineRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Evaluate every rule in priority order
    pub fn evaluate_all(&self, snapshot: &EvaluationSnapshot<'_>) -> Vec<RuleOutcome> {
        self.rules.iter().map(|r| r.evaluate(snapshot)).collect()
    }

    /// Winning rule for a snapshot, if any fires
    pub fn decide(&self, snapshot: &EvaluationSnapshot<'_>) -> Option<RuleOutcome> {
        arbitrate(self.evaluate_all(snapshot))
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// Pick the firing outcome with the highest confidence; earlier wins ties
pub fn arbitrate(outcomes: Vec<RuleOutcome>) -> Option<RuleOutcome> {
    outcomes
        .into_iter()
        .filter(|o| o.should_quarantine)
        .fold(None, |best: Option<RuleOutcome>, candidate| match best {
            Some(b) if b.confidence >= candidate.confidence => Some(b),
            _ => Some(candidate),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot<'a>(
        identity: &'a TestIdentity,
        policy: &'a QuarantinePolicy,
    ) -> EvaluationSnapshot<'a> {
        EvaluationSnapshot {
            identity,
            failure_rate: 0.0,
            confidence: 0.0,
            total_runs: 0,
            consecutive_failures: 0,
            recent_failure_rate: 0.0,
            recent_samples: 0,
            is_high_impact: false,
            policy,
        }
    }

    #[test]
    fn test_high_failure_rate_fires() {
        let id = TestIdentity::new("p", "t");
        let policy = QuarantinePolicy::builtin("p");
        let s = EvaluationSnapshot {
            failure_rate: 0.65,
            confidence: 0.75,
            total_runs: 10,
            ..snapshot(&id, &policy)
        };
        let outcome = HighFailureRate.evaluate(&s);
        assert!(outcome.should_quarantine);
        assert_eq!(outcome.confidence, 0.75);
        assert_eq!(outcome.impact_score, 0.65);

        let s_high = EvaluationSnapshot {
            is_high_impact: true,
            ..s.clone()
        };
        assert_eq!(HighFailureRate.evaluate(&s_high).impact_score, 1.3);

        let few_runs = EvaluationSnapshot { total_runs: 4, ..s };
        assert!(!HighFailureRate.evaluate(&few_runs).should_quarantine);
    }

    #[test]
    fn test_consecutive_failures_boost() {
        let id = TestIdentity::new("p", "t");
        let policy = QuarantinePolicy::builtin("p");
        let s = EvaluationSnapshot {
            consecutive_failures: 3,
            confidence: 0.6,
            ..snapshot(&id, &policy)
        };
        let outcome = ConsecutiveFailures.evaluate(&s);
        assert!(outcome.should_quarantine);
        assert!((outcome.confidence - 0.9).abs() < 1e-9);
        assert!((outcome.impact_score - 0.9).abs() < 1e-9);

        let capped = EvaluationSnapshot {
            consecutive_failures: 8,
            ..s.clone()
        };
        assert_eq!(ConsecutiveFailures.evaluate(&capped).confidence, 1.0);

        let low_conf = EvaluationSnapshot {
            confidence: 0.55,
            ..s
        };
        assert!(!ConsecutiveFailures.evaluate(&low_conf).should_quarantine);
    }

    #[test]
    fn test_critical_path_requires_high_impact() {
        let id = TestIdentity::new("p", "t");
        let policy = QuarantinePolicy::builtin("p");
        let s = EvaluationSnapshot {
            failure_rate: 0.5,
            confidence: 0.6,
            ..snapshot(&id, &policy)
        };
        assert!(!CriticalPathImpact.evaluate(&s).should_quarantine);

        let high = EvaluationSnapshot {
            is_high_impact: true,
            ..s
        };
        let outcome = CriticalPathImpact.evaluate(&high);
        assert!(outcome.should_quarantine);
        assert!((outcome.confidence - 0.72).abs() < 1e-9);
        assert!((outcome.impact_score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_rapid_degradation() {
        let id = TestIdentity::new("p", "t");
        let policy = QuarantinePolicy::builtin("p");
        let s = EvaluationSnapshot {
            failure_rate: 0.2,
            confidence: 0.6,
            recent_failure_rate: 0.5,
            recent_samples: 10,
            ..snapshot(&id, &policy)
        };
        assert!(RapidDegradation.evaluate(&s).should_quarantine);

        let few = EvaluationSnapshot {
            recent_samples: 2,
            ..s.clone()
        };
        assert!(!RapidDegradation.evaluate(&few).should_quarantine);

        let steady = EvaluationSnapshot {
            recent_failure_rate: 0.25,
            ..s
        };
        assert!(!RapidDegradation.evaluate(&steady).should_quarantine);
    }

    #[test]
    fn test_arbitration_picks_highest_confidence() {
        // High failure rate fires at 0.75, consecutive failures boosts 0.75 + 0.3
        let id = TestIdentity::new("p", "t");
        let policy = QuarantinePolicy::builtin("p");
        let s = EvaluationSnapshot {
            failure_rate: 0.65,
            confidence: 0.75,
            total_runs: 10,
            consecutive_failures: 3,
            ..snapshot(&id, &policy)
        };
        let rules = RuleSet::standard();
        let outcomes = rules.evaluate_all(&s);
        assert_eq!(outcomes.iter().filter(|o| o.should_quarantine).count(), 2);
        let winner = rules.decide(&s).unwrap();
        assert_eq!(winner.rule, "consecutive_failures");
        assert!((winner.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_arbitration_ties_keep_priority() {
        let a = RuleOutcome::fire("first", "a".into(), 0.8, 1.0);
        let b = RuleOutcome::fire("second", "b".into(), 0.8, 2.0);
        assert_eq!(arbitrate(vec![a, b]).unwrap().rule, "first");
        assert!(arbitrate(vec![RuleOutcome::pass("x")]).is_none());
    }

    #[test]
    fn test_custom_rule_appended() {
        struct Never;
        impl QuarantineRule for Never {
            fn name(&self) -> &'static str {
                "never"
            }
            fn evaluate(&self, _: &EvaluationSnapshot<'_>) -> RuleOutcome {
                RuleOutcome::pass("never")
            }
        }
        let rules = RuleSet::standard().with_rule(Never);
        assert_eq!(rules.names().last(), Some(&"never"));
        assert_eq!(RuleSet::empty().names().len(), 0);
    }
}
