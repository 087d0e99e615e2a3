//! Flaky detector: runs the classifier over stored history and persists patterns
//!
//! Classification must never block run ingestion: store failures for one
//! group are logged and counted, and the pass continues with the next group.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::analysis::{FlakyAnalysis, FlakyClassifier};
use crate::state::{FlakyTestPattern, PatternStore, RunHistory, RunOutcome, TestIdentity};

/// Summary of one classification pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    /// Identities seen in the lookback window
    pub groups: usize,
    /// Identities with enough runs to classify
    pub analyzed: usize,
    /// Identities classified flaky
    pub flaky: usize,
    /// Identities skipped for insufficient sample size
    pub insufficient: usize,
    /// Groups skipped because of store errors
    pub errors: Vec<String>,
}

/// Couples the classifier with the history provider and the pattern store
pub struct FlakyDetector {
    classifier: FlakyClassifier,
    history: Arc<dyn RunHistory>,
    patterns: Arc<dyn PatternStore>,
}

impl FlakyDetector {
    pub fn new(
        classifier: FlakyClassifier,
        history: Arc<dyn RunHistory>,
        patterns: Arc<dyn PatternStore>,
    ) -> Self {
        Self {
            classifier,
            history,
            patterns,
        }
    }

    pub fn classifier(&self) -> &FlakyClassifier {
        &self.classifier
    }

    /// Start of the lookback window ending at `now`
    pub fn lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.classifier.config().lookback_days))
    }

    /// Classify one identity and upsert its pattern.
    ///
    /// Returns the stored pattern, or `None` when the sample is too small or
    /// a store error occurred (logged).
    pub fn analyze_identity(
        &self,
        identity: &TestIdentity,
        now: DateTime<Utc>,
    ) -> Option<FlakyTestPattern> {
        let runs = match self
            .history
            .find_run_outcomes(identity, self.lookback_start(now))
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(test = %identity, error = %e, "Failed to load run history, skipping classification");
                return None;
            }
        };
        let analysis = self.classifier.analyze(identity, &runs, now)?;
        self.persist(&analysis).ok()
    }

    /// Classify every identity of a project seen in the lookback window
    pub fn analyze_project(&self, project_id: &str, now: DateTime<Utc>) -> ClassificationReport {
        let mut report = ClassificationReport::default();
        let runs = match self
            .history
            .project_run_outcomes(project_id, self.lookback_start(now))
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!(project = project_id, error = %e, "Failed to load project history");
                report.errors.push(e.to_string());
                return report;
            }
        };

        let groups = group_by_identity(runs);
        report.groups = groups.len();

        for (identity, runs) in groups {
            let Some(analysis) = self.classifier.analyze(&identity, &runs, now) else {
                report.insufficient += 1;
                continue;
            };
            match self.persist(&analysis) {
                Ok(_) => {
                    report.analyzed += 1;
                    if analysis.is_flaky {
                        report.flaky += 1;
                    }
                }
                Err(e) => report.errors.push(format!("{}: {}", identity, e)),
            }
        }

        info!(
            project = project_id,
            groups = report.groups,
            analyzed = report.analyzed,
            flaky = report.flaky,
            errors = report.errors.len(),
            "Classification pass complete"
        );
        report
    }

    fn persist(&self, analysis: &FlakyAnalysis) -> Result<FlakyTestPattern, String> {
        match self.patterns.upsert_pattern_stats(&analysis.to_pattern()) {
            Ok(stored) => {
                debug!(
                    test = %analysis.identity,
                    failure_rate = analysis.failure_rate,
                    confidence = analysis.confidence,
                    is_flaky = analysis.is_flaky,
                    pattern = %analysis.failure_pattern,
                    "Pattern updated"
                );
                Ok(stored)
            }
            Err(e) => {
                warn!(test = %analysis.identity, error = %e, "Failed to persist flaky pattern, skipping");
                Err(e.to_string())
            }
        }
    }
}

/// Group runs by identity, preserving chronological order within each group
pub fn group_by_identity(runs: Vec<RunOutcome>) -> BTreeMap<TestIdentity, Vec<RunOutcome>> {
    let mut groups: BTreeMap<TestIdentity, Vec<RunOutcome>> = BTreeMap::new();
    for run in runs {
        groups.entry(run.identity.clone()).or_default().push(run);
    }
    for runs in groups.values_mut() {
        runs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::state::{InMemoryStore, RunStatus};

    fn setup() -> (Arc<InMemoryStore>, FlakyDetector) {
        let store = InMemoryStore::new().shared();
        let detector = FlakyDetector::new(
            FlakyClassifier::new(ClassifierConfig::default()),
            store.clone(),
            store.clone(),
        );
        (store, detector)
    }

    fn seed(store: &InMemoryStore, name: &str, pattern: &[bool], now: DateTime<Utc>) {
        let runs: Vec<RunOutcome> = pattern
            .iter()
            .enumerate()
            .map(|(i, failed)| {
                RunOutcome::new(
                    TestIdentity::new("proj", name),
                    if *failed {
                        RunStatus::Failed
                    } else {
                        RunStatus::Passed
                    },
                    now - Duration::hours(100 - i as i64 * 4),
                    "main",
                )
            })
            .collect();
        store.record_runs(&runs).unwrap();
    }

    #[test]
    fn test_project_pass_counts_groups() {
        let (store, detector) = setup();
        let now = Utc::now();
        let mut flaky = vec![false; 20];
        for i in [1, 6, 11, 16] {
            flaky[i] = true;
        }
        seed(&store, "flaky_one", &flaky, now);
        seed(&store, "stable", &[false; 20], now);
        seed(&store, "new", &[true, false], now);

        let report = detector.analyze_project("proj", now);
        assert_eq!(report.groups, 3);
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.insufficient, 1);
        assert!(report.errors.is_empty());

        let stable = store
            .get_pattern(&TestIdentity::new("proj", "stable"))
            .unwrap()
            .unwrap();
        assert!(!stable.is_active);
        assert!(store
            .get_pattern(&TestIdentity::new("proj", "new"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failures_ceasing_deactivates_pattern() {
        let (store, detector) = setup();
        let now = Utc::now();
        let mut flaky = vec![false; 20];
        for i in [1, 6, 11, 16] {
            flaky[i] = true;
        }
        seed(&store, "t", &flaky, now);
        let id = TestIdentity::new("proj", "t");
        let first = detector.analyze_identity(&id, now).unwrap();
        assert!(first.is_active);

        // Forty days later only fresh passing runs remain in the window
        let later = now + Duration::days(40);
        seed(&store, "t", &[false; 20], later);
        let second = detector.analyze_identity(&id, later).unwrap();
        assert!(!second.is_active);
        assert_eq!(second.failed_runs, 0);
        assert_eq!(second.first_detected_at, first.first_detected_at);
    }

    #[test]
    fn test_group_by_identity_sorts() {
        let now = Utc::now();
        let id = TestIdentity::new("p", "a");
        let groups = group_by_identity(vec![
            RunOutcome::new(id.clone(), RunStatus::Passed, now, "m"),
            RunOutcome::new(id.clone(), RunStatus::Failed, now - Duration::hours(1), "m"),
        ]);
        assert_eq!(groups[&id][0].status, RunStatus::Failed);
    }
}
