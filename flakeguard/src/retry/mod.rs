//! Retry / Circuit-Breaker Engine
//!
//! Decides whether a failed test is retried, after how long, and whether
//! the retry channel for that test is open.
//!
//! ```text
//! RetryRequest ─▶ RetryEngine ─▶ arbitrate_policies ─▶ RetryDecision
//!                     │
//!                     ├─ CircuitBreakerState  key (policy, test)
//!                     ├─ RetryBudgetState     key (policy, project)
//!                     └─ BackoffCalculator    immediate | linear | exponential
//!                                             fibonacci | polynomial | custom
//! ```

pub mod backoff;
pub mod budget;
pub mod circuit_breaker;
pub mod conditions;
pub mod engine;
pub mod formula;
pub mod policy;
pub mod state_store;

pub use backoff::{BackoffCalculator, BackoffConfig, BackoffStrategy, JitterKind, RandomSource};
pub use budget::{BudgetStatus, BudgetWindow, RetryBudgetLimits, RetryBudgetState};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use conditions::{
    ConditionContext, ConditionKind, ConditionOperator, RetryCondition, TimeWindow, WindowAction,
};
pub use engine::{
    arbitrate_policies, FlakyStatus, PolicyVerdict, RetryDecision, RetryEngine, RetryRequest,
};
pub use formula::{Formula, FormulaError, FormulaVars};
pub use policy::RetryPolicy;
pub use state_store::{InMemoryRetryState, RetryStateStore};
