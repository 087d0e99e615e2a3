//! Flaky classification of a single test's run history
//!
//! Pure statistics over a bounded window: no I/O, no randomness. The
//! [`super::detector::FlakyDetector`] feeds it and persists the result.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::stats::{self, RunCounts};
use crate::config::ClassifierConfig;
use crate::state::{FailurePattern, FlakyTestPattern, RunOutcome, TestIdentity};

/// Failure rates beyond these bounds look deterministic, not flaky
const DETERMINISTIC_LOW: f64 = 0.05;
const DETERMINISTIC_HIGH: f64 = 0.95;

/// Canonical flaky band
const FLAKY_BAND: (f64, f64) = (0.10, 0.60);

/// Runs needed for full sample-size confidence
const FULL_CONFIDENCE_RUNS: f64 = 20.0;

const DETERMINISTIC_FACTOR: f64 = 0.3;
const FLAKY_BAND_FACTOR: f64 = 1.2;
const TEMPORAL_FACTOR: f64 = 1.1;
const BRANCH_FACTOR: f64 = 1.15;

/// Branch spread that boosts confidence
const BRANCH_CONFIDENCE_SPREAD: f64 = 0.2;

/// Branch spread that marks a test environment-dependent
const ENVIRONMENT_SPREAD: f64 = 0.1;

/// Consecutive failures that mark a test timing-sensitive
const TIMING_CONSECUTIVE_FAILURES: u32 = 3;

/// Failure rate above which a fix is called out as high priority
const HIGH_FAILURE_RATE_NOTE: f64 = 0.3;

fn timing_keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)timeout|race|wait|async").expect("static regex"))
}

fn network_keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)network|connection").expect("static regex"))
}

/// Signals that shaped the confidence score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSignals {
    pub temporal_cluster: bool,
    /// max - min per-branch failure rate, when at least two branches ran
    pub branch_spread: Option<f64>,
    pub max_consecutive_failures: u32,
    pub timing_errors: bool,
    pub network_errors: bool,
}

/// Result of analyzing one test identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyAnalysis {
    pub identity: TestIdentity,
    pub total_runs: u32,
    pub failed_runs: u32,
    pub failure_rate: f64,
    pub confidence: f64,
    pub is_flaky: bool,
    pub failure_pattern: FailurePattern,
    pub recommendations: Vec<String>,
    pub signals: ConfidenceSignals,
    pub analyzed_at: DateTime<Utc>,
}

impl FlakyAnalysis {
    /// Pattern record carrying these statistics (quarantine fields cleared)
    pub fn to_pattern(&self) -> FlakyTestPattern {
        let mut pattern = FlakyTestPattern::empty(self.identity.clone(), self.analyzed_at);
        pattern.total_runs = self.total_runs;
        pattern.failed_runs = self.failed_runs;
        pattern.failure_rate = self.failure_rate;
        pattern.confidence = self.confidence;
        pattern.failure_pattern = Some(self.failure_pattern);
        pattern.recommendations = self.recommendations.clone();
        pattern.is_active = self.is_flaky;
        pattern
    }
}

/// Statistical flaky classifier
#[derive(Debug, Clone, Default)]
pub struct FlakyClassifier {
    config: ClassifierConfig,
}

impl FlakyClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Analyze one identity's runs (oldest first).
    ///
    /// Returns `None` when fewer than `min_runs` non-skipped runs exist.
    pub fn analyze(
        &self,
        identity: &TestIdentity,
        runs: &[RunOutcome],
        now: DateTime<Utc>,
    ) -> Option<FlakyAnalysis> {
        let counts = RunCounts::of(runs);
        if counts.total < self.config.min_runs || counts.total == 0 {
            return None;
        }
        let failure_rate = counts.failure_rate();

        let branch_rates = stats::branch_failure_rates(runs);
        let error_text = runs
            .iter()
            .filter(|r| r.is_failure())
            .filter_map(|r| r.error_text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        let signals = ConfidenceSignals {
            temporal_cluster: stats::failures_cluster(runs, Duration::hours(24)),
            branch_spread: stats::branch_spread(&branch_rates),
            max_consecutive_failures: stats::max_consecutive_failures(runs),
            timing_errors: timing_keywords().is_match(&error_text),
            network_errors: network_keywords().is_match(&error_text),
        };

        let confidence = confidence_score(counts.total, failure_rate, &signals);
        let is_flaky = failure_rate >= self.config.flaky_threshold
            && failure_rate < DETERMINISTIC_HIGH
            && confidence >= self.config.confidence_threshold;
        let failure_pattern = classify_pattern(&signals);
        let recommendations = recommendations(failure_pattern, failure_rate, &signals);

        Some(FlakyAnalysis {
            identity: identity.clone(),
            total_runs: counts.total,
            failed_runs: counts.failed,
            failure_rate,
            confidence,
            is_flaky,
            failure_pattern,
            recommendations,
            signals,
            analyzed_at: now,
        })
    }
}

/// Sample-size confidence adjusted by the flakiness signals, clamped to [0, 1]
pub fn confidence_score(total_runs: u32, failure_rate: f64, signals: &ConfidenceSignals) -> f64 {
    let mut confidence = (total_runs as f64 / FULL_CONFIDENCE_RUNS).min(1.0);

    if !(DETERMINISTIC_LOW..=DETERMINISTIC_HIGH).contains(&failure_rate) {
        confidence *= DETERMINISTIC_FACTOR;
    }
    if (FLAKY_BAND.0..=FLAKY_BAND.1).contains(&failure_rate) {
        confidence *= FLAKY_BAND_FACTOR;
    }
    if signals.temporal_cluster {
        confidence *= TEMPORAL_FACTOR;
    }
    if signals
        .branch_spread
        .is_some_and(|spread| spread > BRANCH_CONFIDENCE_SPREAD)
    {
        confidence *= BRANCH_FACTOR;
    }

    confidence.clamp(0.0, 1.0)
}

/// First matching pattern wins
pub fn classify_pattern(signals: &ConfidenceSignals) -> FailurePattern {
    if signals
        .branch_spread
        .is_some_and(|spread| spread > ENVIRONMENT_SPREAD)
    {
        FailurePattern::EnvironmentDependent
    } else if signals.max_consecutive_failures >= TIMING_CONSECUTIVE_FAILURES
        || signals.timing_errors
    {
        FailurePattern::TimingSensitive
    } else {
        FailurePattern::Intermittent
    }
}

fn recommendations(
    pattern: FailurePattern,
    failure_rate: f64,
    signals: &ConfidenceSignals,
) -> Vec<String> {
    let base: &[&str] = match pattern {
        FailurePattern::EnvironmentDependent => &[
            "Check environment-specific configuration",
            "Compare behavior across branches and environments",
            "Add environment guards or setup validation",
        ],
        FailurePattern::TimingSensitive => &[
            "Replace fixed sleeps with explicit waits",
            "Review async ordering and potential race conditions",
            "Increase timeouts for slow operations",
        ],
        FailurePattern::Intermittent => &[
            "Add logging around the failing assertion",
            "Check for shared state between tests",
            "Consider isolating the test",
        ],
    };
    let mut out: Vec<String> = base.iter().map(|s| s.to_string()).collect();
    if failure_rate > HIGH_FAILURE_RATE_NOTE {
        out.push("High failure rate - consider prioritising a fix".to_string());
    }
    if signals.network_errors {
        out.push("Network-related failures detected - add retry/mocking for network calls".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunStatus;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn identity() -> TestIdentity {
        TestIdentity::new("proj", "test_checkout").with_suite("payments")
    }

    /// Builds runs spaced `gap_hours` apart from a (status, branch, error) list
    fn runs(plan: &[(RunStatus, &str)], gap_hours: i64) -> Vec<RunOutcome> {
        plan.iter()
            .enumerate()
            .map(|(i, (status, branch))| {
                let mut run = RunOutcome::new(
                    identity(),
                    *status,
                    base() + Duration::hours(i as i64 * gap_hours),
                    *branch,
                );
                if *status == RunStatus::Failed {
                    run = run.with_error("assertion failed: expected 200");
                }
                run
            })
            .collect()
    }

    #[test]
    fn test_below_min_runs_is_not_classified() {
        let classifier = FlakyClassifier::default();
        let r = runs(&[(RunStatus::Failed, "main"); 4], 1);
        assert!(classifier.analyze(&identity(), &r, base()).is_none());
    }

    #[test]
    fn test_skipped_runs_do_not_count_toward_min_runs() {
        let classifier = FlakyClassifier::default();
        let mut plan = vec![(RunStatus::Passed, "main"); 4];
        plan.extend(vec![(RunStatus::Skipped, "main"); 5]);
        assert!(classifier.analyze(&identity(), &runs(&plan, 1), base()).is_none());
    }

    #[test]
    fn test_branch_spread_scenario_is_environment_dependent() {
        // main: 1 of 10 fail (0.1); feature: 3 of 6 fail (0.5)
        let mut plan = vec![(RunStatus::Failed, "main")];
        plan.extend(vec![(RunStatus::Passed, "main"); 9]);
        plan.extend([
            (RunStatus::Failed, "feature"),
            (RunStatus::Passed, "feature"),
            (RunStatus::Failed, "feature"),
            (RunStatus::Passed, "feature"),
            (RunStatus::Failed, "feature"),
            (RunStatus::Passed, "feature"),
        ]);
        let classifier = FlakyClassifier::default();
        let analysis = classifier
            .analyze(&identity(), &runs(&plan, 36), base())
            .unwrap();

        assert_eq!(analysis.total_runs, 16);
        assert_eq!(analysis.failed_runs, 4);
        assert_eq!(analysis.failure_rate, 0.25);
        assert_eq!(analysis.failure_pattern, FailurePattern::EnvironmentDependent);
        // 16/20 * 1.2 (flaky band) * 1.15 (branch spread 0.4)
        assert!((analysis.confidence - 1.0).abs() < 1e-9);
        assert!(analysis.is_flaky);
    }

    #[test]
    fn test_deterministic_failure_is_not_flaky() {
        let classifier = FlakyClassifier::default();
        let r = runs(&[(RunStatus::Failed, "main"); 20], 1);
        let analysis = classifier.analyze(&identity(), &r, base()).unwrap();
        assert_eq!(analysis.failure_rate, 1.0);
        assert!(!analysis.is_flaky);
        assert!(analysis.confidence <= 0.35);
        assert_eq!(analysis.failure_pattern, FailurePattern::TimingSensitive);
    }

    #[test]
    fn test_timing_keywords_mark_timing_sensitive() {
        let mut r = runs(
            &[
                (RunStatus::Failed, "main"),
                (RunStatus::Passed, "main"),
                (RunStatus::Passed, "main"),
                (RunStatus::Passed, "main"),
                (RunStatus::Passed, "main"),
            ],
            48,
        );
        r[0].error_text = Some("Timeout waiting for element #submit".into());
        let analysis = FlakyClassifier::default()
            .analyze(&identity(), &r, base())
            .unwrap();
        assert_eq!(analysis.failure_pattern, FailurePattern::TimingSensitive);
        assert!(analysis.signals.timing_errors);
    }

    #[test]
    fn test_intermittent_and_recommendations() {
        let mut plan = vec![(RunStatus::Passed, "main"); 6];
        plan[1] = (RunStatus::Failed, "main");
        plan[4] = (RunStatus::Failed, "main");
        let mut r = runs(&plan, 48);
        r[4].error_text = Some("connection reset by peer".into());
        let analysis = FlakyClassifier::default()
            .analyze(&identity(), &r, base())
            .unwrap();
        assert_eq!(analysis.failure_pattern, FailurePattern::Intermittent);
        assert!(analysis.failure_rate > 0.3);
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.starts_with("High failure rate")));
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.starts_with("Network-related")));
    }

    #[test]
    fn test_confidence_bounds() {
        let mut signals = ConfidenceSignals {
            temporal_cluster: true,
            branch_spread: Some(0.9),
            ..Default::default()
        };
        for total in [1, 5, 20, 500] {
            for rate in [0.0, 0.01, 0.1, 0.3, 0.6, 0.97, 1.0] {
                let c = confidence_score(total, rate, &signals);
                assert!((0.0..=1.0).contains(&c), "confidence {c} out of range");
            }
        }
        signals.temporal_cluster = false;
        signals.branch_spread = None;
        assert_eq!(confidence_score(10, 0.3, &signals), 0.6);
    }

    #[test]
    fn test_to_pattern_marks_active_when_flaky() {
        let mut plan = vec![(RunStatus::Passed, "main"); 20];
        for i in [2, 7, 12, 17] {
            plan[i] = (RunStatus::Failed, "main");
        }
        let analysis = FlakyClassifier::default()
            .analyze(&identity(), &runs(&plan, 12), base())
            .unwrap();
        let pattern = analysis.to_pattern();
        assert_eq!(pattern.is_active, analysis.is_flaky);
        assert_eq!(pattern.failed_runs, 4);
        assert!(!pattern.is_quarantined);
    }
}
