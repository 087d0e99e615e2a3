//! Quarantine Rule Engine and Policy Manager
//!
//! Decides when a flaky test stops blocking builds and when it has
//! stabilized enough to block them again.
//!
//! ```text
//! FlakyTestPattern + recent runs + active policy
//!         │
//!         ▼
//! ┌─────────────────────────────────────────┐
//! │ RuleSet (priority order)                │
//! │  1. high_failure_rate                   │
//! │  2. consecutive_failures                │
//! │  3. critical_path_impact                │
//! │  4. rapid_degradation                   │
//! └─────────────────────────────────────────┘
//!         │ firing rules
//!         ▼
//!   arbitrate: highest confidence, earlier rule on ties
//!         │
//!         ▼
//!   try_quarantine (atomic) ─▶ history entry + impact window
//! ```

pub mod engine;
pub mod manager;
pub mod policy;
pub mod rules;

pub use engine::{QuarantineDecision, QuarantineEngine, UnquarantineEvaluation};
pub use manager::{ImpactSimulation, QuarantinePolicyManager, SimulatedChange};
pub use policy::{QuarantinePolicy, HIGH_IMPACT_KEYWORDS};
pub use rules::{
    arbitrate, ConsecutiveFailures, CriticalPathImpact, EvaluationSnapshot, HighFailureRate,
    QuarantineRule, RapidDegradation, RuleOutcome, RuleSet,
};
