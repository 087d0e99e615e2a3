//! FlakeGuard service facade
//!
//! Wires the classifier, quarantine engine, policy manager and retry engine
//! to a set of backends and a clock, and exposes the external interfaces:
//! ingestion, retry queries, quarantine queries and policy configuration.
//!
//! ```text
//!  CI webhook ──▶ submit_run_outcomes ──▶ FlakyDetector ──▶ QuarantineEngine
//!  orchestrator ─▶ evaluate_retry ──────▶ RetryEngine
//!  scheduler ───▶ run_*_sweep ──────────▶ SweepGuard ─▶ detector / engine
//!  admin UI ────▶ policy CRUD, simulate_policy_impact, recommended_policy
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier::{FlakyClassifier, FlakyDetector};
use crate::clock::{SharedClock, SystemClock};
use crate::config::FlakeguardConfig;
use crate::degraded::Degraded;
use crate::error::{FlakeguardResult, PolicyError};
use crate::quarantine::{
    ImpactSimulation, QuarantineDecision, QuarantineEngine, QuarantinePolicy,
    QuarantinePolicyManager, UnquarantineEvaluation,
};
use crate::retry::{
    BackoffCalculator, BudgetStatus, CircuitBreakerState, FlakyStatus, InMemoryRetryState,
    RetryDecision, RetryEngine, RetryPolicy, RetryRequest, RetryStateStore,
};
use crate::state::{
    FlakyTestPattern, ImpactDelta, ImpactWindow, InMemoryStore, PatternStore, PolicyStore,
    QuarantineHistoryEntry, RunHistory, RunOutcome, TestIdentity, TriggeredBy,
};
use crate::sweep::{SweepGuard, SweepKind, SweepReport};
use crate::validation::SavedPolicy;

/// Storage the service runs against
#[derive(Clone)]
pub struct Backends {
    pub history: Arc<dyn RunHistory>,
    pub patterns: Arc<dyn PatternStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub retry_state: Arc<dyn RetryStateStore>,
}

impl Backends {
    /// Everything in process memory
    pub fn in_memory() -> Self {
        let store = InMemoryStore::new().shared();
        Self {
            history: store.clone(),
            patterns: store.clone(),
            policies: store,
            retry_state: InMemoryRetryState::new().shared(),
        }
    }
}

/// A batch of results from one CI build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBatch {
    pub project_id: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    pub outcomes: Vec<RunOutcome>,
}

impl RunBatch {
    pub fn new(project_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            branch: branch.into(),
            commit: None,
            build_id: None,
            outcomes: Vec::new(),
        }
    }

    /// Outcomes stamped with the batch's project, branch, commit and build
    fn normalized(self) -> Vec<RunOutcome> {
        let Self {
            project_id,
            branch,
            commit,
            build_id,
            outcomes,
        } = self;
        outcomes
            .into_iter()
            .map(|mut run| {
                run.identity.project_id = project_id.clone();
                if run.branch.is_empty() {
                    run.branch = branch.clone();
                }
                if run.commit.is_none() {
                    run.commit = commit.clone();
                }
                if run.build_id.is_none() {
                    run.build_id = build_id.clone();
                }
                run
            })
            .collect()
    }
}

/// What happened to an ingested batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub stored: usize,
    /// Identities with enough history to classify
    pub analyzed: usize,
    pub flaky: usize,
    /// Identities quarantined as a result of this batch
    pub quarantined: Vec<TestIdentity>,
    pub warnings: Vec<String>,
}

pub struct FlakeGuard {
    config: FlakeguardConfig,
    clock: SharedClock,
    backends: Backends,
    detector: FlakyDetector,
    quarantine: Arc<QuarantineEngine>,
    manager: QuarantinePolicyManager,
    retry: RetryEngine,
    sweeps: SweepGuard,
}

impl FlakeGuard {
    pub fn new(config: FlakeguardConfig, backends: Backends, clock: SharedClock) -> Self {
        let detector = FlakyDetector::new(
            FlakyClassifier::new(config.classifier.clone()),
            backends.history.clone(),
            backends.patterns.clone(),
        );
        let quarantine = Arc::new(QuarantineEngine::new(
            config.quarantine.clone(),
            config.classifier.lookback_days,
            backends.history.clone(),
            backends.patterns.clone(),
        ));
        let manager = QuarantinePolicyManager::new(
            backends.policies.clone(),
            backends.patterns.clone(),
            quarantine.clone(),
        );
        let retry = RetryEngine::new(backends.retry_state.clone());
        Self {
            config,
            clock,
            backends,
            detector,
            quarantine,
            manager,
            retry,
            sweeps: SweepGuard::new(),
        }
    }

    /// In-memory backends on the system clock
    pub fn in_memory(config: FlakeguardConfig) -> Self {
        Self::new(config, Backends::in_memory(), Arc::new(SystemClock))
    }

    /// Replace the backoff calculator (jitter source)
    pub fn with_backoff(mut self, backoff: BackoffCalculator) -> Self {
        self.retry = self.retry.with_backoff(backoff);
        self
    }

    pub fn config(&self) -> &FlakeguardConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn sweeps(&self) -> &SweepGuard {
        &self.sweeps
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Store a batch, classify the touched tests and evaluate quarantine for
    /// every test that failed in the batch
    pub fn submit_run_outcomes(&self, batch: RunBatch) -> IngestionReport {
        let now = self.now();
        let project_id = batch.project_id.clone();
        let outcomes = batch.normalized();
        let mut report = IngestionReport::default();

        if let Err(e) = self.backends.history.record_runs(&outcomes) {
            warn!(project = %project_id, error = %e, "Failed to store run outcomes");
            report.warnings.push(format!("store run outcomes: {}", e));
            return report;
        }
        report.stored = outcomes.len();

        let touched: BTreeSet<&TestIdentity> = outcomes.iter().map(|r| &r.identity).collect();
        let failed: BTreeSet<&TestIdentity> = outcomes
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| &r.identity)
            .collect();

        for identity in &touched {
            if let Some(pattern) = self.detector.analyze_identity(identity, now) {
                report.analyzed += 1;
                if pattern.is_active {
                    report.flaky += 1;
                }
            }
        }

        if !failed.is_empty() {
            let policy = self.manager.active_policy(&project_id);
            for identity in failed {
                let decision = self.quarantine.evaluate_quarantine(
                    identity,
                    &policy,
                    TriggeredBy::System,
                    now,
                );
                report.warnings.extend(decision.warnings);
                if decision.value.transitioned {
                    report.quarantined.push(identity.clone());
                }
            }
        }

        info!(
            project = %project_id,
            stored = report.stored,
            analyzed = report.analyzed,
            flaky = report.flaky,
            quarantined = report.quarantined.len(),
            "Run outcomes ingested"
        );
        report
    }

    // =========================================================================
    // Retry queries
    // =========================================================================

    /// Decide whether a failed test is retried.
    ///
    /// The flaky status is read from the latest committed pattern unless
    /// the request carries one.
    pub fn evaluate_retry(&self, mut request: RetryRequest) -> Degraded<RetryDecision> {
        let now = self.now();
        let mut warnings = Vec::new();
        if request.flaky.is_none() {
            match self.backends.patterns.get_pattern(&request.identity()) {
                Ok(pattern) => request.flaky = pattern.as_ref().map(flaky_status),
                Err(e) => warnings.push(format!("load flaky pattern: {}", e)),
            }
        }

        let policies = match self.backends.policies.list_retry_policies() {
            Ok(policies) => policies,
            Err(e) => {
                return Degraded::unavailable(
                    RetryDecision::denied("Retry policies unavailable"),
                    format!("load retry policies: {}", e),
                )
            }
        };

        let mut result = self.retry.evaluate(&policies, &request, now);
        for warning in warnings {
            result.degrade(warning);
        }
        result
    }

    /// Consume budget for a retry the orchestrator dispatched
    pub fn record_retry_dispatched(
        &self,
        policy_id: &str,
        project_id: &str,
    ) -> Degraded<Option<BudgetStatus>> {
        match self.backends.policies.get_retry_policy(policy_id) {
            Ok(Some(policy)) => self.retry.record_dispatched(&policy, project_id, self.now()),
            Ok(None) => Degraded::unavailable(None, format!("retry policy {} not found", policy_id)),
            Err(e) => Degraded::unavailable(None, format!("load retry policy {}: {}", policy_id, e)),
        }
    }

    /// Feed the outcome of a retry into the (policy, test) circuit breaker
    pub fn report_retry_outcome(
        &self,
        policy_id: &str,
        identity: &TestIdentity,
        success: bool,
    ) -> Degraded<Option<CircuitBreakerState>> {
        match self.backends.policies.get_retry_policy(policy_id) {
            Ok(Some(policy)) => self.retry.report_outcome(&policy, identity, success, self.now()),
            Ok(None) => Degraded::unavailable(None, format!("retry policy {} not found", policy_id)),
            Err(e) => Degraded::unavailable(None, format!("load retry policy {}: {}", policy_id, e)),
        }
    }

    pub fn breaker_state(
        &self,
        policy_id: &str,
        identity: &TestIdentity,
    ) -> FlakeguardResult<Option<CircuitBreakerState>> {
        Ok(self.retry.breaker_state(policy_id, identity)?)
    }

    pub fn budget_status(
        &self,
        policy_id: &str,
        project_id: &str,
    ) -> FlakeguardResult<Option<BudgetStatus>> {
        let policy = self.get_retry_policy(policy_id)?;
        Ok(self.retry.budget_status(&policy, project_id, self.now())?)
    }

    // =========================================================================
    // Quarantine queries
    // =========================================================================

    /// Whether a test is quarantined; `false` with a warning when unreadable
    pub fn is_quarantined(&self, identity: &TestIdentity) -> Degraded<bool> {
        match self.backends.patterns.get_pattern(identity) {
            Ok(pattern) => Degraded::full(pattern.is_some_and(|p| p.is_quarantined)),
            Err(e) => Degraded::unavailable(false, format!("load pattern for {}: {}", identity, e)),
        }
    }

    pub fn pattern(&self, identity: &TestIdentity) -> FlakeguardResult<Option<FlakyTestPattern>> {
        Ok(self.backends.patterns.get_pattern(identity)?)
    }

    pub fn patterns(&self, project_id: &str) -> FlakeguardResult<Vec<FlakyTestPattern>> {
        Ok(self.backends.patterns.list_patterns(project_id)?)
    }

    pub fn evaluate_quarantine(
        &self,
        identity: &TestIdentity,
        triggered_by: TriggeredBy,
    ) -> Degraded<QuarantineDecision> {
        let policy = self.manager.active_policy(&identity.project_id);
        self.quarantine
            .evaluate_quarantine(identity, &policy, triggered_by, self.now())
    }

    pub fn quarantine_manually(
        &self,
        identity: &TestIdentity,
        user: &str,
        reason: &str,
    ) -> Degraded<QuarantineDecision> {
        self.quarantine
            .quarantine_manually(identity, user, reason, self.now())
    }

    /// Check stability criteria and release the test if they hold
    pub fn evaluate_unquarantine(
        &self,
        identity: &TestIdentity,
        triggered_by: TriggeredBy,
    ) -> Degraded<UnquarantineEvaluation> {
        let policy = self.manager.active_policy(&identity.project_id);
        self.quarantine
            .evaluate_unquarantine(identity, &policy, triggered_by, self.now())
    }

    /// Release a test regardless of stability (manual override)
    pub fn unquarantine(
        &self,
        identity: &TestIdentity,
        triggered_by: TriggeredBy,
        reason: &str,
    ) -> Degraded<bool> {
        self.quarantine
            .unquarantine(identity, triggered_by, reason, self.now())
    }

    /// Add savings counters to the test's open impact window
    pub fn record_impact(
        &self,
        identity: &TestIdentity,
        delta: &ImpactDelta,
    ) -> FlakeguardResult<bool> {
        Ok(self.backends.patterns.record_impact(identity, delta)?)
    }

    pub fn quarantine_history(
        &self,
        identity: &TestIdentity,
    ) -> FlakeguardResult<Vec<QuarantineHistoryEntry>> {
        Ok(self.backends.patterns.history(identity)?)
    }

    pub fn impact_windows(&self, identity: &TestIdentity) -> FlakeguardResult<Vec<ImpactWindow>> {
        Ok(self.backends.patterns.impact_windows(identity)?)
    }

    // =========================================================================
    // Retry policy configuration
    // =========================================================================

    pub fn create_retry_policy(
        &self,
        mut policy: RetryPolicy,
    ) -> FlakeguardResult<SavedPolicy<RetryPolicy>> {
        let warnings = policy.validate().into_result()?;
        let now = self.now();
        policy.id = Uuid::new_v4().to_string();
        policy.created_at = now;
        policy.updated_at = now;
        self.backends.policies.put_retry_policy(&policy)?;
        info!(policy_id = %policy.id, name = %policy.name, priority = policy.priority, "Retry policy created");
        Ok(SavedPolicy { policy, warnings })
    }

    /// Replace a retry policy, keeping its id and creation time
    pub fn update_retry_policy(
        &self,
        id: &str,
        mut policy: RetryPolicy,
    ) -> FlakeguardResult<SavedPolicy<RetryPolicy>> {
        let existing = self.get_retry_policy(id)?;
        policy.id = existing.id;
        policy.created_at = existing.created_at;
        policy.updated_at = self.now();
        let warnings = policy.validate().into_result()?;
        self.backends.policies.put_retry_policy(&policy)?;
        info!(policy_id = %policy.id, "Retry policy updated");
        Ok(SavedPolicy { policy, warnings })
    }

    pub fn delete_retry_policy(&self, id: &str) -> FlakeguardResult<()> {
        if !self.backends.policies.delete_retry_policy(id)? {
            return Err(PolicyError::NotFound(id.to_string()).into());
        }
        info!(policy_id = id, "Retry policy deleted");
        Ok(())
    }

    pub fn get_retry_policy(&self, id: &str) -> FlakeguardResult<RetryPolicy> {
        self.backends
            .policies
            .get_retry_policy(id)?
            .ok_or_else(|| PolicyError::NotFound(id.to_string()).into())
    }

    /// All retry policies, highest priority first
    pub fn list_retry_policies(&self) -> FlakeguardResult<Vec<RetryPolicy>> {
        Ok(self.backends.policies.list_retry_policies()?)
    }

    /// Active policies that apply to a project, highest priority first
    pub fn active_retry_policies(&self, project_id: &str) -> FlakeguardResult<Vec<RetryPolicy>> {
        Ok(self
            .list_retry_policies()?
            .into_iter()
            .filter(|p| p.applies_to(project_id))
            .collect())
    }

    // =========================================================================
    // Quarantine policy configuration
    // =========================================================================

    pub fn create_quarantine_policy(
        &self,
        policy: QuarantinePolicy,
    ) -> FlakeguardResult<SavedPolicy<QuarantinePolicy>> {
        self.manager.create(policy, self.now())
    }

    pub fn update_quarantine_policy(
        &self,
        id: &str,
        policy: QuarantinePolicy,
    ) -> FlakeguardResult<SavedPolicy<QuarantinePolicy>> {
        self.manager.update(id, policy, self.now())
    }

    pub fn delete_quarantine_policy(&self, id: &str) -> FlakeguardResult<()> {
        self.manager.delete(id)
    }

    pub fn get_quarantine_policy(&self, id: &str) -> FlakeguardResult<QuarantinePolicy> {
        self.manager.get(id)
    }

    pub fn list_quarantine_policies(
        &self,
        project_id: &str,
    ) -> FlakeguardResult<Vec<QuarantinePolicy>> {
        self.manager.list(project_id)
    }

    pub fn activate_quarantine_policy(&self, id: &str) -> FlakeguardResult<QuarantinePolicy> {
        self.manager.activate(id, self.now())
    }

    /// The policy quarantine evaluation currently uses for a project
    pub fn active_quarantine_policy(&self, project_id: &str) -> QuarantinePolicy {
        self.manager.active_policy(project_id)
    }

    pub fn simulate_policy_impact(
        &self,
        project_id: &str,
        candidate: &QuarantinePolicy,
    ) -> FlakeguardResult<ImpactSimulation> {
        self.manager.simulate_impact(project_id, candidate, self.now())
    }

    pub fn recommended_policy(&self, project_id: &str) -> FlakeguardResult<QuarantinePolicy> {
        self.manager.recommended_policy(project_id, self.now())
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Re-classify every test of a project; `None` if already running
    pub fn run_classification_sweep(&self, project_id: &str) -> Option<SweepReport> {
        let _permit = self.sweeps.try_begin(SweepKind::Classification, project_id)?;
        let started_at = self.now();
        let classification = self.detector.analyze_project(project_id, started_at);
        let report = SweepReport {
            kind: SweepKind::Classification,
            project_id: project_id.to_string(),
            started_at,
            finished_at: self.now(),
            examined: classification.groups,
            flaky: classification.flaky,
            transitions: 0,
            warnings: classification.errors,
        };
        info!(
            project = project_id,
            examined = report.examined,
            flaky = report.flaky,
            "Classification sweep complete"
        );
        Some(report)
    }

    /// Review every quarantined test of a project; `None` if already running
    pub fn run_unquarantine_sweep(&self, project_id: &str) -> Option<SweepReport> {
        let _permit = self.sweeps.try_begin(SweepKind::Unquarantine, project_id)?;
        let started_at = self.now();
        let mut report = SweepReport {
            kind: SweepKind::Unquarantine,
            project_id: project_id.to_string(),
            started_at,
            finished_at: started_at,
            examined: 0,
            flaky: 0,
            transitions: 0,
            warnings: Vec::new(),
        };

        match self.backends.patterns.list_patterns(project_id) {
            Ok(patterns) => {
                let policy = self.manager.active_policy(project_id);
                for pattern in patterns.iter().filter(|p| p.is_quarantined) {
                    report.examined += 1;
                    let evaluation = self.quarantine.evaluate_unquarantine(
                        &pattern.identity,
                        &policy,
                        TriggeredBy::Scheduler,
                        self.now(),
                    );
                    report.warnings.extend(evaluation.warnings);
                    if evaluation.value.transitioned {
                        report.transitions += 1;
                    }
                }
                report.flaky = patterns.iter().filter(|p| p.is_active).count();
            }
            Err(e) => {
                warn!(project = project_id, error = %e, "Unquarantine sweep could not list patterns");
                report.warnings.push(format!("list patterns: {}", e));
            }
        }

        report.finished_at = self.now();
        info!(
            project = project_id,
            examined = report.examined,
            unquarantined = report.transitions,
            "Unquarantine sweep complete"
        );
        Some(report)
    }
}

fn flaky_status(pattern: &FlakyTestPattern) -> FlakyStatus {
    FlakyStatus {
        is_flaky: pattern.is_active,
        confidence: pattern.confidence,
        failure_rate: pattern.failure_rate,
    }
}
