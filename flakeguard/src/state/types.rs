//! Core data types for flaky test tracking
//!
//! These types are persisted by the [`super::store`] traits and shared by
//! the classifier, the quarantine engine and the retry engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a quarantine history entry
pub type HistoryId = String;

/// Unique identifier for a policy record
pub type PolicyId = String;

/// Unique key for all aggregation: one test in one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestIdentity {
    pub project_id: String,
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suite: Option<String>,
}

impl TestIdentity {
    /// Create an identity without a suite
    pub fn new(project_id: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            test_name: test_name.into(),
            test_suite: None,
        }
    }

    /// Attach a suite name
    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.test_suite = Some(suite.into());
        self
    }
}

impl std::fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.test_suite {
            Some(suite) => write!(f, "{}/{}::{}", self.project_id, suite, self.test_name),
            None => write!(f, "{}/{}", self.project_id, self.test_name),
        }
    }
}

/// Outcome of a single test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    Failed,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Immutable record of one test run, as supplied by the CI collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub identity: TestIdentity,
    pub status: RunStatus,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default)]
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
}

impl RunOutcome {
    pub fn new(
        identity: TestIdentity,
        status: RunStatus,
        timestamp: DateTime<Utc>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            status,
            timestamp,
            duration_ms: 0,
            error_text: None,
            branch: branch.into(),
            commit: None,
            build_id: None,
        }
    }

    pub fn with_error(mut self, error_text: impl Into<String>) -> Self {
        self.error_text = Some(error_text.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == RunStatus::Failed
    }

    pub fn is_pass(&self) -> bool {
        self.status == RunStatus::Passed
    }
}

/// Dominant failure pattern detected by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePattern {
    /// Failure rate differs markedly between branches/environments
    EnvironmentDependent,
    /// Consecutive failures or timing-related error text
    TimingSensitive,
    /// No stronger signal; failures are scattered
    Intermittent,
}

impl std::fmt::Display for FailurePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnvironmentDependent => write!(f, "environment-dependent"),
            Self::TimingSensitive => write!(f, "timing-sensitive"),
            Self::Intermittent => write!(f, "intermittent"),
        }
    }
}

/// Aggregate flaky state for one test identity.
///
/// Statistics are written only by the classifier; the quarantine fields
/// are written only by the quarantine engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakyTestPattern {
    pub identity: TestIdentity,
    pub total_runs: u32,
    pub failed_runs: u32,
    /// failed_runs / total_runs, in [0, 1]
    pub failure_rate: f64,
    /// Classifier confidence, in [0, 1]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_pattern: Option<FailurePattern>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Whether the latest analysis classified the test as flaky
    pub is_active: bool,
    pub is_quarantined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,
    pub first_detected_at: DateTime<Utc>,
    pub last_analyzed_at: DateTime<Utc>,
}

impl FlakyTestPattern {
    /// Empty, inactive pattern for an identity with no analysis yet
    pub fn empty(identity: TestIdentity, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            total_runs: 0,
            failed_runs: 0,
            failure_rate: 0.0,
            confidence: 0.0,
            failure_pattern: None,
            recommendations: Vec::new(),
            is_active: false,
            is_quarantined: false,
            quarantined_at: None,
            quarantined_by: None,
            quarantine_reason: None,
            first_detected_at: now,
            last_analyzed_at: now,
        }
    }

    /// Clear quarantine fields (unquarantined state)
    pub fn clear_quarantine(&mut self) {
        self.is_quarantined = false;
        self.quarantined_at = None;
        self.quarantined_by = None;
        self.quarantine_reason = None;
    }
}

/// Quarantine marker written atomically by [`super::PatternStore::try_quarantine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineMark {
    pub at: DateTime<Utc>,
    pub by: String,
    pub reason: String,
}

/// Who triggered a quarantine transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    /// Rule engine on ingestion
    System,
    /// Periodic sweep
    Scheduler,
    /// Manual override
    User { name: String },
}

impl TriggeredBy {
    pub fn user(name: impl Into<String>) -> Self {
        Self::User { name: name.into() }
    }
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Scheduler => write!(f, "scheduler"),
            Self::User { name } => write!(f, "user:{}", name),
        }
    }
}

/// Quarantine transition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineAction {
    Quarantined,
    Unquarantined,
}

impl std::fmt::Display for QuarantineAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quarantined => write!(f, "quarantined"),
            Self::Unquarantined => write!(f, "unquarantined"),
        }
    }
}

/// Immutable, append-only record of a quarantine transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineHistoryEntry {
    pub id: HistoryId,
    pub identity: TestIdentity,
    pub action: QuarantineAction,
    pub reason: String,
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl QuarantineHistoryEntry {
    pub fn new(
        identity: TestIdentity,
        action: QuarantineAction,
        reason: impl Into<String>,
        triggered_by: TriggeredBy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity,
            action,
            reason: reason.into(),
            triggered_by,
            metadata: HashMap::new(),
            created_at,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Savings accounting window, open while a test is quarantined.
///
/// Counters are populated by the CI-result collaborator through
/// [`super::PatternStore::record_impact`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactWindow {
    pub id: String,
    pub identity: TestIdentity,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub ci_minutes_saved: f64,
    pub developer_hours_saved: f64,
    pub builds_protected: u32,
}

impl ImpactWindow {
    pub fn open(identity: TestIdentity, opened_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            identity,
            opened_at,
            closed_at: None,
            ci_minutes_saved: 0.0,
            developer_hours_saved: 0.0,
            builds_protected: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Increment applied to an open impact window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactDelta {
    pub ci_minutes_saved: f64,
    pub developer_hours_saved: f64,
    pub builds_protected: u32,
}
