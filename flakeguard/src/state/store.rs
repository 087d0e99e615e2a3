//! Persistence traits and the in-memory state store
//!
//! The traits describe the boundary to whatever backend holds run history,
//! patterns and policies. [`InMemoryStore`] keeps everything in ordered maps
//! behind a single `RwLock`; quarantine transitions are atomic
//! check-and-set operations under the write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use super::schema::{keys, kind};
use super::types::*;
use crate::quarantine::policy::QuarantinePolicy;
use crate::retry::policy::RetryPolicy;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// History provider: run outcomes for a test identity within a window.
pub trait RunHistory: Send + Sync {
    /// Append run outcomes
    fn record_runs(&self, outcomes: &[RunOutcome]) -> StoreResult<()>;

    /// Run outcomes for one identity at or after `since`, oldest first
    fn find_run_outcomes(
        &self,
        identity: &TestIdentity,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<RunOutcome>>;

    /// Run outcomes for every identity of a project at or after `since`, oldest first
    fn project_run_outcomes(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<RunOutcome>>;
}

/// Flaky pattern aggregate, quarantine history and impact windows.
pub trait PatternStore: Send + Sync {
    fn get_pattern(&self, identity: &TestIdentity) -> StoreResult<Option<FlakyTestPattern>>;

    /// Insert or update classifier statistics.
    ///
    /// Quarantine fields and `first_detected_at` of an existing record are
    /// preserved; the stored record is returned.
    fn upsert_pattern_stats(&self, pattern: &FlakyTestPattern) -> StoreResult<FlakyTestPattern>;

    fn list_patterns(&self, project_id: &str) -> StoreResult<Vec<FlakyTestPattern>>;

    /// Atomically mark a pattern quarantined.
    ///
    /// Returns `Ok(false)` without writing if it is already quarantined.
    fn try_quarantine(&self, identity: &TestIdentity, mark: &QuarantineMark) -> StoreResult<bool>;

    /// Atomically clear the quarantine fields.
    ///
    /// Returns `Ok(false)` without writing if it is not quarantined.
    fn try_unquarantine(&self, identity: &TestIdentity) -> StoreResult<bool>;

    fn append_history(&self, entry: &QuarantineHistoryEntry) -> StoreResult<()>;

    fn history(&self, identity: &TestIdentity) -> StoreResult<Vec<QuarantineHistoryEntry>>;

    fn open_impact_window(&self, window: &ImpactWindow) -> StoreResult<()>;

    /// Close the open window for an identity, if any
    fn close_impact_window(
        &self,
        identity: &TestIdentity,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ImpactWindow>>;

    /// Add counters to the open window. Returns `Ok(false)` if none is open.
    fn record_impact(&self, identity: &TestIdentity, delta: &ImpactDelta) -> StoreResult<bool>;

    fn impact_windows(&self, identity: &TestIdentity) -> StoreResult<Vec<ImpactWindow>>;
}

/// Quarantine and retry policy records.
pub trait PolicyStore: Send + Sync {
    fn put_quarantine_policy(&self, policy: &QuarantinePolicy) -> StoreResult<()>;
    fn get_quarantine_policy(&self, id: &str) -> StoreResult<Option<QuarantinePolicy>>;
    fn delete_quarantine_policy(&self, id: &str) -> StoreResult<bool>;
    fn list_quarantine_policies(&self, project_id: &str) -> StoreResult<Vec<QuarantinePolicy>>;

    fn put_retry_policy(&self, policy: &RetryPolicy) -> StoreResult<()>;
    fn get_retry_policy(&self, id: &str) -> StoreResult<Option<RetryPolicy>>;
    fn delete_retry_policy(&self, id: &str) -> StoreResult<bool>;
    fn list_retry_policies(&self) -> StoreResult<Vec<RetryPolicy>>;
}

/// Shared reference to the in-memory store
pub type SharedStore = Arc<InMemoryStore>;

#[derive(Default)]
struct Inner {
    patterns: BTreeMap<String, FlakyTestPattern>,
    runs: BTreeMap<String, Vec<RunOutcome>>,
    history: BTreeMap<String, Vec<QuarantineHistoryEntry>>,
    impact: BTreeMap<String, Vec<ImpactWindow>>,
    quarantine_policies: HashMap<PolicyId, QuarantinePolicy>,
    retry_policies: HashMap<PolicyId, RetryPolicy>,
}

/// In-memory implementation of every store trait
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Values of a map whose keys start with `prefix`
fn scan_prefix<'a, V>(
    map: &'a BTreeMap<String, V>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a V> + 'a {
    map.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(_, v)| v)
}

impl RunHistory for InMemoryStore {
    fn record_runs(&self, outcomes: &[RunOutcome]) -> StoreResult<()> {
        let mut inner = self.write()?;
        for outcome in outcomes {
            let runs = inner.runs.entry(keys::runs(&outcome.identity)).or_default();
            // Keep each identity's history ordered by timestamp
            let pos = runs.partition_point(|r| r.timestamp <= outcome.timestamp);
            runs.insert(pos, outcome.clone());
        }
        Ok(())
    }

    fn find_run_outcomes(
        &self,
        identity: &TestIdentity,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<RunOutcome>> {
        let inner = self.read()?;
        Ok(inner
            .runs
            .get(&keys::runs(identity))
            .map(|runs| {
                runs.iter()
                    .filter(|r| r.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn project_run_outcomes(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<RunOutcome>> {
        let inner = self.read()?;
        let prefix = keys::project_prefix(kind::RUNS, project_id);
        let mut outcomes: Vec<RunOutcome> = scan_prefix(&inner.runs, &prefix)
            .flatten()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect();
        outcomes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(outcomes)
    }
}

impl PatternStore for InMemoryStore {
    fn get_pattern(&self, identity: &TestIdentity) -> StoreResult<Option<FlakyTestPattern>> {
        let inner = self.read()?;
        Ok(inner.patterns.get(&keys::pattern(identity)).cloned())
    }

    fn upsert_pattern_stats(&self, pattern: &FlakyTestPattern) -> StoreResult<FlakyTestPattern> {
        let mut inner = self.write()?;
        let key = keys::pattern(&pattern.identity);
        let stored = match inner.patterns.get(&key) {
            Some(existing) => FlakyTestPattern {
                is_quarantined: existing.is_quarantined,
                quarantined_at: existing.quarantined_at,
                quarantined_by: existing.quarantined_by.clone(),
                quarantine_reason: existing.quarantine_reason.clone(),
                first_detected_at: existing.first_detected_at,
                ..pattern.clone()
            },
            None => pattern.clone(),
        };
        inner.patterns.insert(key, stored.clone());
        Ok(stored)
    }

    fn list_patterns(&self, project_id: &str) -> StoreResult<Vec<FlakyTestPattern>> {
        let inner = self.read()?;
        let prefix = keys::project_prefix(kind::PATTERN, project_id);
        Ok(scan_prefix(&inner.patterns, &prefix).cloned().collect())
    }

    fn try_quarantine(&self, identity: &TestIdentity, mark: &QuarantineMark) -> StoreResult<bool> {
        let mut inner = self.write()?;
        let key = keys::pattern(identity);
        let pattern = inner
            .patterns
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if pattern.is_quarantined {
            return Ok(false);
        }
        pattern.is_quarantined = true;
        pattern.quarantined_at = Some(mark.at);
        pattern.quarantined_by = Some(mark.by.clone());
        pattern.quarantine_reason = Some(mark.reason.clone());
        Ok(true)
    }

    fn try_unquarantine(&self, identity: &TestIdentity) -> StoreResult<bool> {
        let mut inner = self.write()?;
        let key = keys::pattern(identity);
        let pattern = inner
            .patterns
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if !pattern.is_quarantined {
            return Ok(false);
        }
        pattern.clear_quarantine();
        Ok(true)
    }

    fn append_history(&self, entry: &QuarantineHistoryEntry) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner
            .history
            .entry(keys::history(&entry.identity))
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn history(&self, identity: &TestIdentity) -> StoreResult<Vec<QuarantineHistoryEntry>> {
        let inner = self.read()?;
        Ok(inner
            .history
            .get(&keys::history(identity))
            .cloned()
            .unwrap_or_default())
    }

    fn open_impact_window(&self, window: &ImpactWindow) -> StoreResult<()> {
        let mut inner = self.write()?;
        let windows = inner
            .impact
            .entry(keys::impact(&window.identity))
            .or_default();
        if windows.iter().any(ImpactWindow::is_open) {
            return Err(StoreError::Conflict(format!(
                "impact window already open for {}",
                window.identity
            )));
        }
        windows.push(window.clone());
        Ok(())
    }

    fn close_impact_window(
        &self,
        identity: &TestIdentity,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ImpactWindow>> {
        let mut inner = self.write()?;
        let Some(windows) = inner.impact.get_mut(&keys::impact(identity)) else {
            return Ok(None);
        };
        Ok(windows.iter_mut().find(|w| w.is_open()).map(|w| {
            w.closed_at = Some(at);
            w.clone()
        }))
    }

    fn record_impact(&self, identity: &TestIdentity, delta: &ImpactDelta) -> StoreResult<bool> {
        let mut inner = self.write()?;
        let open = inner
            .impact
            .get_mut(&keys::impact(identity))
            .and_then(|windows| windows.iter_mut().find(|w| w.is_open()));
        match open {
            Some(window) => {
                window.ci_minutes_saved += delta.ci_minutes_saved;
                window.developer_hours_saved += delta.developer_hours_saved;
                window.builds_protected += delta.builds_protected;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn impact_windows(&self, identity: &TestIdentity) -> StoreResult<Vec<ImpactWindow>> {
        let inner = self.read()?;
        Ok(inner
            .impact
            .get(&keys::impact(identity))
            .cloned()
            .unwrap_or_default())
    }
}

impl PolicyStore for InMemoryStore {
    fn put_quarantine_policy(&self, policy: &QuarantinePolicy) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner
            .quarantine_policies
            .insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    fn get_quarantine_policy(&self, id: &str) -> StoreResult<Option<QuarantinePolicy>> {
        Ok(self.read()?.quarantine_policies.get(id).cloned())
    }

    fn delete_quarantine_policy(&self, id: &str) -> StoreResult<bool> {
        Ok(self.write()?.quarantine_policies.remove(id).is_some())
    }

    fn list_quarantine_policies(&self, project_id: &str) -> StoreResult<Vec<QuarantinePolicy>> {
        let inner = self.read()?;
        let mut policies: Vec<QuarantinePolicy> = inner
            .quarantine_policies
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect();
        policies.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(policies)
    }

    fn put_retry_policy(&self, policy: &RetryPolicy) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.retry_policies.insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    fn get_retry_policy(&self, id: &str) -> StoreResult<Option<RetryPolicy>> {
        Ok(self.read()?.retry_policies.get(id).cloned())
    }

    fn delete_retry_policy(&self, id: &str) -> StoreResult<bool> {
        Ok(self.write()?.retry_policies.remove(id).is_some())
    }

    fn list_retry_policies(&self) -> StoreResult<Vec<RetryPolicy>> {
        let inner = self.read()?;
        let mut policies: Vec<RetryPolicy> = inner.retry_policies.values().cloned().collect();
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(policies)
    }
}
