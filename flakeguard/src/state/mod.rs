//! State module for flaky test tracking
//!
//! This module provides the persistence boundary for:
//! - Run outcomes supplied by the CI collaborator (history provider)
//! - Flaky test patterns (aggregate classifier + quarantine state)
//! - Append-only quarantine history and impact windows
//! - Quarantine and retry policy records
//!
//! # Architecture
//!
//! Storage is expressed as three traits ([`RunHistory`], [`PatternStore`],
//! [`PolicyStore`]) so any backend supporting filtered range queries and
//! upserts can be plugged in. [`InMemoryStore`] implements all three and is
//! what the CLI and the tests use.
//!
//! # Usage
//!
//! ```ignore
//! use flakeguard::state::{InMemoryStore, PatternStore, TestIdentity};
//!
//! let store = InMemoryStore::new().shared();
//! let pattern = store.get_pattern(&TestIdentity::new("proj", "test_login"))?;
//! ```

pub mod schema;
pub mod store;
pub mod types;

// Re-export core types
pub use store::{
    InMemoryStore, PatternStore, PolicyStore, RunHistory, SharedStore, StoreError, StoreResult,
};
pub use types::{
    FailurePattern, FlakyTestPattern, HistoryId, ImpactDelta, ImpactWindow, PolicyId,
    QuarantineAction, QuarantineHistoryEntry, QuarantineMark, RunOutcome, RunStatus, TestIdentity,
    TriggeredBy,
};
