//! FlakeGuard Library
//!
//! Decides, for every test a CI system reports on:
//! - whether it is flaky (explainable statistics over a bounded run window)
//! - whether it should be quarantined, and when it has stabilized enough to
//!   block builds again
//! - whether a failure should be retried, after how long, and whether the
//!   retry channel for that test is currently open
//!
//! # Modules
//!
//! ## Classification
//! - [`classifier`]: failure rate, confidence score, failure pattern and
//!   recommendations per test identity
//!
//! ## Quarantine
//! - [`quarantine`]: rule registry, quarantine state machine, per-project
//!   policies, recommended policy and impact simulation
//!
//! ## Retry
//! - [`retry`]: prioritized retry policies, backoff strategies, condition
//!   matching, circuit breakers and sliding retry budgets
//!
//! ## Plumbing
//! - [`state`]: persistence traits and the in-memory store
//! - [`service`]: the [`FlakeGuard`] facade
//! - [`sweep`]: skip-if-running periodic sweeps
//!
//! # Usage
//!
//! ```ignore
//! use flakeguard::{FlakeGuard, FlakeguardConfig, RetryRequest};
//!
//! let guard = FlakeGuard::in_memory(FlakeguardConfig::from_env());
//! let decision = guard.evaluate_retry(RetryRequest::new("web", "checkout_flow", 0));
//! if decision.value.should_retry {
//!     println!("retry in {} ms", decision.value.delay_ms);
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod classifier;
pub mod clock;
pub mod config;
pub mod degraded;
pub mod error;
pub mod quarantine;
pub mod retry;
pub mod service;
pub mod state;
pub mod sweep;
pub mod validation;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ClassifierConfig, FlakeguardConfig, QuarantineEngineConfig, SweepConfig};
pub use degraded::{Degraded, DegradationLevel};
pub use error::{ConfigError, FlakeguardError, FlakeguardResult, PolicyError};
pub use quarantine::{QuarantineDecision, QuarantinePolicy, UnquarantineEvaluation};
pub use retry::{RetryDecision, RetryPolicy, RetryRequest};
pub use service::{Backends, FlakeGuard, IngestionReport, RunBatch};
pub use sweep::{spawn_periodic_sweeps, SweepKind, SweepReport};
pub use validation::{SavedPolicy, ValidationReport};
