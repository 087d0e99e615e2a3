//! Run-history statistics shared by the classifier and the quarantine engine
//!
//! All helpers ignore skipped runs and expect input ordered oldest first
//! unless stated otherwise.

use std::collections::BTreeMap;

use chrono::Duration;

use crate::state::{RunOutcome, RunStatus};

/// Pass/fail counts over non-skipped runs
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunCounts {
    pub total: u32,
    pub failed: u32,
    pub passed: u32,
}

impl RunCounts {
    pub fn of(runs: &[RunOutcome]) -> Self {
        runs.iter().fold(Self::default(), |mut acc, run| {
            match run.status {
                RunStatus::Passed => {
                    acc.total += 1;
                    acc.passed += 1;
                }
                RunStatus::Failed => {
                    acc.total += 1;
                    acc.failed += 1;
                }
                RunStatus::Skipped => {}
            }
            acc
        })
    }

    /// failed / total, 0.0 when there are no runs
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    /// passed / total, 0.0 when there are no runs
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

/// Failure rate per branch
pub fn branch_failure_rates(runs: &[RunOutcome]) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, RunCounts> = BTreeMap::new();
    for run in runs {
        let entry = counts.entry(run.branch.clone()).or_default();
        match run.status {
            RunStatus::Passed => {
                entry.total += 1;
                entry.passed += 1;
            }
            RunStatus::Failed => {
                entry.total += 1;
                entry.failed += 1;
            }
            RunStatus::Skipped => {}
        }
    }
    counts
        .into_iter()
        .filter(|(_, c)| c.total > 0)
        .map(|(branch, c)| (branch, c.failure_rate()))
        .collect()
}

/// Spread (max - min) of per-branch failure rates; `None` below two branches
pub fn branch_spread(rates: &BTreeMap<String, f64>) -> Option<f64> {
    if rates.len() < 2 {
        return None;
    }
    let max = rates.values().copied().fold(f64::MIN, f64::max);
    let min = rates.values().copied().fold(f64::MAX, f64::min);
    Some(max - min)
}

/// Longest run of consecutive failures anywhere in the sequence
pub fn max_consecutive_failures(runs: &[RunOutcome]) -> u32 {
    let mut best = 0;
    let mut current = 0;
    for run in runs.iter().filter(|r| r.status != RunStatus::Skipped) {
        if run.is_failure() {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}

/// Consecutive failures counted back from the most recent run
pub fn trailing_failures(runs: &[RunOutcome]) -> u32 {
    trailing(runs, RunStatus::Failed)
}

/// Consecutive passes counted back from the most recent run
pub fn trailing_successes(runs: &[RunOutcome]) -> u32 {
    trailing(runs, RunStatus::Passed)
}

fn trailing(runs: &[RunOutcome], status: RunStatus) -> u32 {
    runs.iter()
        .rev()
        .filter(|r| r.status != RunStatus::Skipped)
        .take_while(|r| r.status == status)
        .count() as u32
}

/// Whether two chronologically adjacent failures are closer than `within`
pub fn failures_cluster(runs: &[RunOutcome], within: Duration) -> bool {
    let failures: Vec<_> = runs
        .iter()
        .filter(|r| r.is_failure())
        .map(|r| r.timestamp)
        .collect();
    failures.windows(2).any(|pair| pair[1] - pair[0] < within)
}

/// The last `n` non-skipped runs, oldest first
pub fn recent_runs(runs: &[RunOutcome], n: usize) -> Vec<&RunOutcome> {
    let mut recent: Vec<&RunOutcome> = runs
        .iter()
        .rev()
        .filter(|r| r.status != RunStatus::Skipped)
        .take(n)
        .collect();
    recent.reverse();
    recent
}

/// Mean duration in minutes of non-skipped runs that report one
pub fn mean_duration_minutes(runs: &[RunOutcome]) -> Option<f64> {
    let durations: Vec<u64> = runs
        .iter()
        .filter(|r| r.status != RunStatus::Skipped && r.duration_ms > 0)
        .map(|r| r.duration_ms)
        .collect();
    if durations.is_empty() {
        return None;
    }
    let total: u64 = durations.iter().sum();
    Some(total as f64 / durations.len() as f64 / 60_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TestIdentity;
    use chrono::{TimeZone, Utc};

    fn run(status: RunStatus, hour: i64, branch: &str) -> RunOutcome {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        RunOutcome::new(
            TestIdentity::new("p", "t"),
            status,
            base + Duration::hours(hour),
            branch,
        )
    }

    use crate::state::RunStatus::{Failed as F, Passed as P, Skipped as S};

    #[test]
    fn test_counts_ignore_skipped() {
        let runs = vec![run(P, 0, "m"), run(F, 1, "m"), run(S, 2, "m")];
        let counts = RunCounts::of(&runs);
        assert_eq!(counts.total, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.failure_rate(), 0.5);
        assert_eq!(RunCounts::default().failure_rate(), 0.0);
    }

    #[test]
    fn test_branch_spread() {
        let runs = vec![
            run(F, 0, "main"),
            run(P, 1, "main"),
            run(P, 2, "dev"),
            run(P, 3, "dev"),
        ];
        let rates = branch_failure_rates(&runs);
        assert_eq!(rates.len(), 2);
        assert_eq!(branch_spread(&rates), Some(0.5));

        let single = branch_failure_rates(&runs[..2]);
        assert_eq!(branch_spread(&single), None);
    }

    #[test]
    fn test_consecutive_failures() {
        let runs = vec![
            run(F, 0, "m"),
            run(F, 1, "m"),
            run(S, 2, "m"),
            run(F, 3, "m"),
            run(P, 4, "m"),
            run(F, 5, "m"),
        ];
        assert_eq!(max_consecutive_failures(&runs), 3);
        assert_eq!(trailing_failures(&runs), 1);
        assert_eq!(trailing_successes(&runs), 0);
    }

    #[test]
    fn test_trailing_successes() {
        let runs = vec![run(F, 0, "m"), run(P, 1, "m"), run(S, 2, "m"), run(P, 3, "m")];
        assert_eq!(trailing_successes(&runs), 2);
    }

    #[test]
    fn test_failure_clustering() {
        let spread = vec![run(F, 0, "m"), run(P, 10, "m"), run(F, 48, "m")];
        assert!(!failures_cluster(&spread, Duration::hours(24)));
        let tight = vec![run(F, 0, "m"), run(F, 5, "m")];
        assert!(failures_cluster(&tight, Duration::hours(24)));
        assert!(!failures_cluster(&tight[..1], Duration::hours(24)));
    }

    #[test]
    fn test_recent_runs_window() {
        let runs = vec![run(F, 0, "m"), run(P, 1, "m"), run(S, 2, "m"), run(F, 3, "m")];
        let recent = recent_runs(&runs, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, P);
        assert_eq!(recent[1].status, F);
    }

    #[test]
    fn test_mean_duration() {
        let runs = vec![
            run(P, 0, "m").with_duration_ms(60_000),
            run(F, 1, "m").with_duration_ms(180_000),
            run(P, 2, "m"),
        ];
        assert_eq!(mean_duration_minutes(&runs), Some(2.0));
        assert_eq!(mean_duration_minutes(&runs[2..]), None);
    }
}
