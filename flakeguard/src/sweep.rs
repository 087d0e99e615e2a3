//! Background sweeps: periodic re-classification and unquarantine review
//!
//! Each (kind, project) sweep runs at most once at a time. A sweep that
//! finds the same sweep already running is skipped, never queued.
//!
//! ```text
//! spawn_periodic_sweeps
//!   loop select!
//!     ├─ cancel.cancelled()      → stop
//!     ├─ classification tick     → run_classification_sweep(p) ∀ projects
//!     └─ unquarantine tick       → run_unquarantine_sweep(p)   ∀ projects
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SweepConfig;
use crate::service::FlakeGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Classification,
    Unquarantine,
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classification => write!(f, "classification"),
            Self::Unquarantine => write!(f, "unquarantine"),
        }
    }
}

/// Result of one completed sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub kind: SweepKind,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Patterns or identities looked at
    pub examined: usize,
    /// Identities currently classified flaky (classification sweeps)
    pub flaky: usize,
    /// Quarantine transitions performed (unquarantine sweeps)
    pub transitions: usize,
    pub warnings: Vec<String>,
}

type SweepKey = (SweepKind, String);

/// Tracks which sweeps are running
#[derive(Debug, Default)]
pub struct SweepGuard {
    running: Mutex<HashSet<SweepKey>>,
}

impl SweepGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the (kind, project) slot; `None` if that sweep is already running
    pub fn try_begin(&self, kind: SweepKind, project_id: &str) -> Option<SweepPermit<'_>> {
        let key = (kind, project_id.to_string());
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(key.clone()) {
            debug!(kind = %kind, project = project_id, "Sweep already running, skipping");
            return None;
        }
        Some(SweepPermit { guard: self, key })
    }

    pub fn is_running(&self, kind: SweepKind, project_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(kind, project_id.to_string()))
    }
}

/// Held for the duration of a sweep; releases the slot on drop
#[derive(Debug)]
pub struct SweepPermit<'a> {
    guard: &'a SweepGuard,
    key: SweepKey,
}

impl Drop for SweepPermit<'_> {
    fn drop(&mut self) {
        self.guard
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Run both sweeps for `projects` on their intervals until `cancel` fires.
///
/// The first tick of each interval fires immediately.
pub fn spawn_periodic_sweeps(
    service: Arc<FlakeGuard>,
    projects: Vec<String>,
    config: SweepConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut classification = tokio::time::interval(config.classification_interval());
        classification.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut unquarantine = tokio::time::interval(config.unquarantine_interval());
        unquarantine.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            projects = projects.len(),
            classification_secs = config.classification_interval().as_secs(),
            unquarantine_secs = config.unquarantine_interval().as_secs(),
            "Periodic sweeps started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Periodic sweeps cancelled");
                    break;
                }
                _ = classification.tick() => {
                    for project in &projects {
                        service.run_classification_sweep(project);
                    }
                }
                _ = unquarantine.tick() => {
                    for project in &projects {
                        service.run_unquarantine_sweep(project);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_skips_overlapping_sweep() {
        let guard = SweepGuard::new();
        let permit = guard.try_begin(SweepKind::Classification, "web");
        assert!(permit.is_some());
        assert!(guard.is_running(SweepKind::Classification, "web"));
        assert!(guard.try_begin(SweepKind::Classification, "web").is_none());

        // Other kinds and projects are independent
        assert!(guard.try_begin(SweepKind::Unquarantine, "web").is_some());
        assert!(guard.try_begin(SweepKind::Classification, "api").is_some());

        drop(permit);
        assert!(!guard.is_running(SweepKind::Classification, "web"));
        assert!(guard.try_begin(SweepKind::Classification, "web").is_some());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(SweepKind::Unquarantine.to_string(), "unquarantine");
    }
}
