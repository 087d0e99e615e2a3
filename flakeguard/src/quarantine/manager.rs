//! Quarantine Policy Manager: per-project policy CRUD, validation,
//! recommended defaults and impact simulation
//!
//! At most one policy per project is active. Writing an active policy
//! deactivates the project's other policies; projects without an active
//! policy evaluate against [`QuarantinePolicy::builtin`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::QuarantineEngine;
use super::policy::QuarantinePolicy;
use crate::classifier::stats;
use crate::error::{FlakeguardResult, PolicyError};
use crate::state::{PatternStore, PolicyStore, QuarantineAction, TestIdentity};
use crate::validation::{SavedPolicy, ValidationReport};

/// Fallback CI minutes per failed run when no durations are recorded
const DEFAULT_RUN_MINUTES: f64 = 5.0;
/// Developer time lost per failed run, in hours
const DEVELOPER_HOURS_PER_FAILURE: f64 = 0.25;
/// Suites with at least this many flaky tests are recommended as high impact
const HIGH_IMPACT_SUITE_MIN_FLAKY: usize = 3;

/// One projected transition in an impact simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedChange {
    pub identity: TestIdentity,
    pub action: QuarantineAction,
    pub reason: String,
}

/// Projected effect of applying a candidate policy to existing patterns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactSimulation {
    pub project_id: String,
    pub total_patterns: usize,
    pub currently_quarantined: usize,
    pub projected_quarantines: usize,
    pub projected_unquarantines: usize,
    /// Quarantined tests after the projected transitions
    pub projected_quarantined_total: usize,
    /// Share of known tests quarantined after the transitions, in percent
    pub projected_quarantine_percentage: f64,
    pub estimated_ci_minutes_saved: f64,
    pub estimated_developer_hours_saved: f64,
    /// Projected quarantines with low failure rate and low confidence
    pub false_positive_risk: usize,
    pub over_quarantine: bool,
    pub risk_flags: Vec<String>,
    pub changes: Vec<SimulatedChange>,
    /// Patterns skipped because their history could not be read
    pub warnings: Vec<String>,
}

/// Policy CRUD and analysis over the policy and pattern stores
pub struct QuarantinePolicyManager {
    policies: Arc<dyn PolicyStore>,
    patterns: Arc<dyn PatternStore>,
    engine: Arc<QuarantineEngine>,
}

impl QuarantinePolicyManager {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        patterns: Arc<dyn PatternStore>,
        engine: Arc<QuarantineEngine>,
    ) -> Self {
        Self {
            policies,
            patterns,
            engine,
        }
    }

    /// Validate thresholds; errors reject a write, warnings flag extreme values
    pub fn validate(policy: &QuarantinePolicy) -> ValidationReport {
        let mut report = ValidationReport::new();
        if policy.project_id.trim().is_empty() {
            report.error("project_id must not be empty");
        }
        if policy.name.trim().is_empty() {
            report.error("name must not be empty");
        }
        report.require_range("failure_rate_threshold", policy.failure_rate_threshold, 0.0, 1.0);
        report.require_range("confidence_threshold", policy.confidence_threshold, 0.0, 1.0);
        report.require_range("success_rate_required", policy.success_rate_required, 0.0, 1.0);
        report.require_range(
            "max_quarantine_percentage",
            policy.max_quarantine_percentage,
            0.0,
            100.0,
        );
        report.require_positive(
            "consecutive_failures_threshold",
            policy.consecutive_failures_threshold.into(),
        );
        report.require_positive("min_runs", policy.min_runs.into());
        report.require_positive("stability_period_days", policy.stability_period_days.into());
        report.require_positive("min_successful_runs", policy.min_successful_runs.into());

        if policy.failure_rate_threshold < 0.1 {
            report.warn("failure_rate_threshold below 0.1 may quarantine stable tests");
        } else if policy.failure_rate_threshold > 0.8 {
            report.warn("failure_rate_threshold above 0.8 will rarely quarantine");
        }
        if policy.confidence_threshold < 0.5 {
            report.warn("confidence_threshold below 0.5 accepts weak classifications");
        }
        if policy.stability_period_days > 30 {
            report.warn("stability_period_days above 30 keeps tests quarantined for long");
        }
        if policy.success_rate_required < 0.8 {
            report.warn("success_rate_required below 0.8 may release unstable tests");
        }
        if policy.max_quarantine_percentage > 50.0 {
            report.warn("max_quarantine_percentage above 50 allows most tests to be quarantined");
        }
        report
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Store a new policy under a fresh id
    pub fn create(
        &self,
        mut policy: QuarantinePolicy,
        now: DateTime<Utc>,
    ) -> FlakeguardResult<SavedPolicy<QuarantinePolicy>> {
        let warnings = Self::validate(&policy).into_result()?;
        policy.id = Uuid::new_v4().to_string();
        policy.created_at = now;
        policy.updated_at = now;
        if policy.is_active {
            self.deactivate_others(&policy.project_id, &policy.id, now)?;
        }
        self.policies.put_quarantine_policy(&policy)?;
        info!(policy_id = %policy.id, project = %policy.project_id, name = %policy.name, "Quarantine policy created");
        Ok(SavedPolicy { policy, warnings })
    }

    /// Replace an existing policy, keeping its id, project and creation time
    pub fn update(
        &self,
        id: &str,
        mut policy: QuarantinePolicy,
        now: DateTime<Utc>,
    ) -> FlakeguardResult<SavedPolicy<QuarantinePolicy>> {
        let existing = self.get(id)?;
        policy.id = existing.id;
        policy.project_id = existing.project_id;
        policy.created_at = existing.created_at;
        policy.updated_at = now;
        let warnings = Self::validate(&policy).into_result()?;
        if policy.is_active {
            self.deactivate_others(&policy.project_id, &policy.id, now)?;
        }
        self.policies.put_quarantine_policy(&policy)?;
        info!(policy_id = %policy.id, project = %policy.project_id, "Quarantine policy updated");
        Ok(SavedPolicy { policy, warnings })
    }

    pub fn delete(&self, id: &str) -> FlakeguardResult<()> {
        if !self.policies.delete_quarantine_policy(id)? {
            return Err(PolicyError::NotFound(id.to_string()).into());
        }
        info!(policy_id = id, "Quarantine policy deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> FlakeguardResult<QuarantinePolicy> {
        self.policies
            .get_quarantine_policy(id)?
            .ok_or_else(|| PolicyError::NotFound(id.to_string()).into())
    }

    /// Policies of a project, most recently updated first
    pub fn list(&self, project_id: &str) -> FlakeguardResult<Vec<QuarantinePolicy>> {
        Ok(self.policies.list_quarantine_policies(project_id)?)
    }

    /// Make a policy the project's only active one
    pub fn activate(&self, id: &str, now: DateTime<Utc>) -> FlakeguardResult<QuarantinePolicy> {
        let mut policy = self.get(id)?;
        self.deactivate_others(&policy.project_id, &policy.id, now)?;
        if !policy.is_active {
            policy.is_active = true;
            policy.updated_at = now;
            self.policies.put_quarantine_policy(&policy)?;
        }
        info!(policy_id = %policy.id, project = %policy.project_id, "Quarantine policy activated");
        Ok(policy)
    }

    fn deactivate_others(
        &self,
        project_id: &str,
        keep_id: &str,
        now: DateTime<Utc>,
    ) -> FlakeguardResult<()> {
        for mut other in self.policies.list_quarantine_policies(project_id)? {
            if other.is_active && other.id != keep_id {
                other.is_active = false;
                other.updated_at = now;
                self.policies.put_quarantine_policy(&other)?;
            }
        }
        Ok(())
    }

    /// The project's active policy, or built-in defaults.
    ///
    /// Evaluation never fails on a policy read; an unreadable store falls
    /// back to the defaults.
    pub fn active_policy(&self, project_id: &str) -> QuarantinePolicy {
        match self.policies.list_quarantine_policies(project_id) {
            Ok(policies) => policies
                .into_iter()
                .find(|p| p.is_active)
                .unwrap_or_else(|| QuarantinePolicy::builtin(project_id)),
            Err(e) => {
                warn!(project = project_id, error = %e, "Failed to load quarantine policy, using defaults");
                QuarantinePolicy::builtin(project_id)
            }
        }
    }

    // =========================================================================
    // Analysis
    // =========================================================================

    /// Derive thresholds from the project's existing patterns
    pub fn recommended_policy(
        &self,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> FlakeguardResult<QuarantinePolicy> {
        let patterns: Vec<_> = self
            .patterns
            .list_patterns(project_id)?
            .into_iter()
            .filter(|p| p.total_runs > 0)
            .collect();

        let mut policy = QuarantinePolicy::new(project_id, "Recommended policy");
        policy.created_at = now;
        policy.updated_at = now;
        if patterns.is_empty() {
            policy.description = Some("No analyzed tests yet; built-in defaults".to_string());
            return Ok(policy);
        }

        let n = patterns.len() as f64;
        let mean_failure_rate = patterns.iter().map(|p| p.failure_rate).sum::<f64>() / n;
        let mean_confidence = patterns.iter().map(|p| p.confidence).sum::<f64>() / n;
        policy.failure_rate_threshold = (mean_failure_rate * 1.2).min(0.7);
        policy.confidence_threshold = (mean_confidence * 0.9).min(0.8);

        let mut flaky_per_suite: BTreeMap<&str, usize> = BTreeMap::new();
        for pattern in patterns.iter().filter(|p| p.is_active) {
            if let Some(suite) = pattern.identity.test_suite.as_deref() {
                *flaky_per_suite.entry(suite).or_default() += 1;
            }
        }
        policy.high_impact_suites = flaky_per_suite
            .into_iter()
            .filter(|(_, count)| *count >= HIGH_IMPACT_SUITE_MIN_FLAKY)
            .map(|(suite, _)| suite.to_string())
            .collect();
        policy.description = Some(format!(
            "Derived from {} analyzed tests: mean failure rate {:.0}%, mean confidence {:.2}",
            patterns.len(),
            mean_failure_rate * 100.0,
            mean_confidence
        ));
        Ok(policy)
    }

    /// Replay the rule engine over existing patterns with a candidate policy
    pub fn simulate_impact(
        &self,
        project_id: &str,
        candidate: &QuarantinePolicy,
        now: DateTime<Utc>,
    ) -> FlakeguardResult<ImpactSimulation> {
        Self::validate(candidate).into_result()?;
        let patterns = self.patterns.list_patterns(project_id)?;

        let mut sim = ImpactSimulation {
            project_id: project_id.to_string(),
            total_patterns: patterns.len(),
            currently_quarantined: 0,
            projected_quarantines: 0,
            projected_unquarantines: 0,
            projected_quarantined_total: 0,
            projected_quarantine_percentage: 0.0,
            estimated_ci_minutes_saved: 0.0,
            estimated_developer_hours_saved: 0.0,
            false_positive_risk: 0,
            over_quarantine: false,
            risk_flags: Vec::new(),
            changes: Vec::new(),
            warnings: Vec::new(),
        };

        for pattern in &patterns {
            if pattern.is_quarantined {
                sim.currently_quarantined += 1;
                let runs = match self.engine.runs_since_quarantine(pattern) {
                    Ok(runs) => runs,
                    Err(e) => {
                        sim.warnings.push(format!("{}: {}", pattern.identity, e));
                        continue;
                    }
                };
                let eval = QuarantineEngine::assess_stability(pattern, &runs, candidate, now);
                if eval.should_unquarantine {
                    sim.projected_unquarantines += 1;
                    sim.changes.push(SimulatedChange {
                        identity: pattern.identity.clone(),
                        action: QuarantineAction::Unquarantined,
                        reason: eval.reason,
                    });
                }
                continue;
            }

            let runs = match self.engine.lookback_runs(&pattern.identity, now) {
                Ok(runs) => runs,
                Err(e) => {
                    sim.warnings.push(format!("{}: {}", pattern.identity, e));
                    continue;
                }
            };
            let decision = self.engine.decide(pattern, &runs, candidate);
            if !decision.should_quarantine {
                continue;
            }
            sim.projected_quarantines += 1;
            let run_minutes = stats::mean_duration_minutes(&runs).unwrap_or(DEFAULT_RUN_MINUTES);
            sim.estimated_ci_minutes_saved += pattern.failed_runs as f64 * run_minutes;
            sim.estimated_developer_hours_saved +=
                pattern.failed_runs as f64 * DEVELOPER_HOURS_PER_FAILURE;
            if pattern.failure_rate < 0.3 && pattern.confidence < 0.7 {
                sim.false_positive_risk += 1;
            }
            sim.changes.push(SimulatedChange {
                identity: pattern.identity.clone(),
                action: QuarantineAction::Quarantined,
                reason: decision.reason,
            });
        }

        sim.projected_quarantined_total =
            sim.currently_quarantined - sim.projected_unquarantines + sim.projected_quarantines;
        if sim.total_patterns > 0 {
            sim.projected_quarantine_percentage =
                sim.projected_quarantined_total as f64 / sim.total_patterns as f64 * 100.0;
        }
        sim.over_quarantine =
            sim.projected_quarantine_percentage > candidate.max_quarantine_percentage;

        if sim.false_positive_risk > 0 {
            sim.risk_flags.push(format!(
                "{} projected quarantines have failure rate below 30% and confidence below 0.7",
                sim.false_positive_risk
            ));
        }
        if sim.over_quarantine {
            sim.risk_flags.push(format!(
                "{:.1}% of tests would be quarantined, above the {:.1}% limit",
                sim.projected_quarantine_percentage, candidate.max_quarantine_percentage
            ));
        }

        info!(
            project = project_id,
            quarantines = sim.projected_quarantines,
            unquarantines = sim.projected_unquarantines,
            over_quarantine = sim.over_quarantine,
            "Policy impact simulated"
        );
        Ok(sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuarantineEngineConfig;
    use crate::error::FlakeguardError;
    use crate::state::{FlakyTestPattern, InMemoryStore, RunHistory, RunOutcome, RunStatus};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemoryStore>, QuarantinePolicyManager) {
        let store = InMemoryStore::new().shared();
        let engine = Arc::new(QuarantineEngine::new(
            QuarantineEngineConfig::default(),
            30,
            store.clone(),
            store.clone(),
        ));
        let manager = QuarantinePolicyManager::new(store.clone(), store.clone(), engine);
        (store, manager)
    }

    fn seed_pattern(
        store: &InMemoryStore,
        identity: TestIdentity,
        failure_rate: f64,
        confidence: f64,
        total_runs: u32,
    ) {
        let mut p = FlakyTestPattern::empty(identity, now());
        p.total_runs = total_runs;
        p.failed_runs = (failure_rate * total_runs as f64).round() as u32;
        p.failure_rate = failure_rate;
        p.confidence = confidence;
        p.is_active = true;
        store.upsert_pattern_stats(&p).unwrap();
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut policy = QuarantinePolicy::new("proj", "bad");
        policy.failure_rate_threshold = 1.2;
        policy.min_runs = 0;
        let report = QuarantinePolicyManager::validate(&policy);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().any(|e| e.contains("failure_rate_threshold")));
        assert!(report.errors.iter().any(|e| e.contains("min_runs")));
    }

    #[test]
    fn test_validate_warns_on_extremes() {
        let mut policy = QuarantinePolicy::new("proj", "loose");
        policy.failure_rate_threshold = 0.05;
        policy.confidence_threshold = 0.4;
        policy.stability_period_days = 45;
        policy.success_rate_required = 0.7;
        policy.max_quarantine_percentage = 60.0;
        let report = QuarantinePolicyManager::validate(&policy);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 5);
    }

    #[test]
    fn test_create_rejects_invalid_write() {
        let (_, manager) = setup();
        let mut policy = QuarantinePolicy::new("proj", "bad");
        policy.confidence_threshold = -0.1;
        let err = manager.create(policy, now()).unwrap_err();
        assert!(matches!(
            err,
            FlakeguardError::Policy(PolicyError::Invalid(_))
        ));
        assert!(manager.list("proj").unwrap().is_empty());
    }

    #[test]
    fn test_single_active_policy_per_project() {
        let (_, manager) = setup();
        let first = manager
            .create(QuarantinePolicy::new("proj", "first"), now())
            .unwrap()
            .policy;
        let second = manager
            .create(
                QuarantinePolicy::new("proj", "second"),
                now() + Duration::minutes(1),
            )
            .unwrap()
            .policy;
        assert_eq!(manager.active_policy("proj").id, second.id);
        assert!(!manager.get(&first.id).unwrap().is_active);

        manager.activate(&first.id, now() + Duration::minutes(2)).unwrap();
        assert_eq!(manager.active_policy("proj").id, first.id);
        let active: Vec<_> = manager
            .list("proj")
            .unwrap()
            .into_iter()
            .filter(|p| p.is_active)
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_update_keeps_identity_and_delete() {
        let (_, manager) = setup();
        let created = manager
            .create(QuarantinePolicy::new("proj", "p"), now())
            .unwrap()
            .policy;
        let mut changed = created.clone();
        changed.project_id = "elsewhere".into();
        changed.min_runs = 8;
        let updated = manager
            .update(&created.id, changed, now() + Duration::hours(1))
            .unwrap()
            .policy;
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.project_id, "proj");
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.min_runs, 8);

        manager.delete(&created.id).unwrap();
        assert!(matches!(
            manager.delete(&created.id),
            Err(FlakeguardError::Policy(PolicyError::NotFound(_)))
        ));
        assert_eq!(manager.active_policy("proj").id, "builtin:proj");
    }

    #[test]
    fn test_recommended_policy_derivation() {
        let (store, manager) = setup();
        for i in 0..3 {
            seed_pattern(
                &store,
                TestIdentity::new("proj", format!("ui_{}", i)).with_suite("ui"),
                0.4,
                0.8,
                20,
            );
        }
        seed_pattern(&store, TestIdentity::new("proj", "api_a").with_suite("api"), 0.8, 0.8, 20);

        let policy = manager.recommended_policy("proj", now()).unwrap();
        // mean failure rate 0.5 -> 0.6, mean confidence 0.8 -> 0.72
        assert!((policy.failure_rate_threshold - 0.6).abs() < 1e-9);
        assert!((policy.confidence_threshold - 0.72).abs() < 1e-9);
        assert_eq!(policy.high_impact_suites, vec!["ui".to_string()]);
        assert!(QuarantinePolicyManager::validate(&policy).is_valid());
    }

    #[test]
    fn test_recommended_policy_caps() {
        let (store, manager) = setup();
        seed_pattern(&store, TestIdentity::new("proj", "a"), 0.9, 1.0, 20);
        let policy = manager.recommended_policy("proj", now()).unwrap();
        assert_eq!(policy.failure_rate_threshold, 0.7);
        assert_eq!(policy.confidence_threshold, 0.8);
    }

    #[test]
    fn test_recommended_policy_low_signal_project() {
        let (store, manager) = setup();
        seed_pattern(&store, TestIdentity::new("proj", "quiet"), 0.05, 0.3, 20);
        let policy = manager.recommended_policy("proj", now()).unwrap();
        // No lower bound: thresholds follow the data down
        assert!((policy.failure_rate_threshold - 0.06).abs() < 1e-9);
        assert!((policy.confidence_threshold - 0.27).abs() < 1e-9);
    }

    #[test]
    fn test_simulate_impact() {
        let (store, manager) = setup();
        for i in 0..4 {
            seed_pattern(&store, TestIdentity::new("proj", format!("bad_{}", i)), 0.7, 0.8, 20);
        }
        seed_pattern(&store, TestIdentity::new("proj", "fine"), 0.05, 0.3, 20);
        let id = TestIdentity::new("proj", "bad_0");
        store
            .record_runs(&[RunOutcome::new(
                id,
                RunStatus::Failed,
                now() - Duration::hours(1),
                "main",
            )
            .with_duration_ms(120_000)])
            .unwrap();

        let candidate = QuarantinePolicy::builtin("proj");
        let sim = manager.simulate_impact("proj", &candidate, now()).unwrap();
        assert_eq!(sim.total_patterns, 5);
        assert_eq!(sim.projected_quarantines, 4);
        assert_eq!(sim.projected_quarantined_total, 4);
        assert!((sim.projected_quarantine_percentage - 80.0).abs() < 1e-9);
        assert!(sim.over_quarantine);
        // 14 failed runs each: bad_0 at 2 minutes, the rest at the 5 minute default
        assert!((sim.estimated_ci_minutes_saved - (14.0 * 2.0 + 3.0 * 14.0 * 5.0)).abs() < 1e-9);
        assert!((sim.estimated_developer_hours_saved - 4.0 * 14.0 * 0.25).abs() < 1e-9);
        assert_eq!(sim.false_positive_risk, 0);
        assert_eq!(sim.risk_flags.len(), 1);
        // Simulation never transitions anything
        assert!(store.list_patterns("proj").unwrap().iter().all(|p| !p.is_quarantined));
    }

    #[test]
    fn test_simulate_flags_false_positives() {
        let (store, manager) = setup();
        seed_pattern(&store, TestIdentity::new("proj", "weak"), 0.25, 0.6, 20);
        let mut candidate = QuarantinePolicy::builtin("proj");
        candidate.failure_rate_threshold = 0.2;
        candidate.confidence_threshold = 0.5;
        candidate.max_quarantine_percentage = 100.0;
        let sim = manager.simulate_impact("proj", &candidate, now()).unwrap();
        assert_eq!(sim.projected_quarantines, 1);
        assert_eq!(sim.false_positive_risk, 1);
        assert!(!sim.over_quarantine);
    }
}
