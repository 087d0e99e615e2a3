//! Retry delay computation
//!
//! ```text
//! raw delay (strategy) ──▶ clamp to max_delay ──▶ jitter ──▶ floor at 0, round
//! ```
//!
//! A broken custom formula never fails the decision: the delay falls back
//! to the base delay and a warning is logged.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::formula::{Formula, FormulaVars};

/// Mapping from attempt number to delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    Linear,
    #[default]
    Exponential,
    Fibonacci,
    Polynomial,
    Custom,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
            Self::Fibonacci => write!(f, "fibonacci"),
            Self::Polynomial => write!(f, "polynomial"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Randomization applied after clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    #[default]
    None,
    /// Adds up to 25% of the delay
    Uniform,
    /// Scales the delay by a factor in [0, 1]
    Exponential,
}

/// Backoff settings of a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    /// Exponential base, or polynomial exponent
    pub multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    pub jitter: JitterKind,
    /// Expression over `attempt` and `baseDelay`, for `custom`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: None,
            jitter: JitterKind::None,
            formula: None,
        }
    }
}

impl BackoffConfig {
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Immediate,
            base_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn linear(base_delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay_ms,
            ..Self::default()
        }
    }

    pub fn exponential(base_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms,
            multiplier,
            ..Self::default()
        }
    }

    pub fn custom(base_delay_ms: u64, formula: impl Into<String>) -> Self {
        Self {
            strategy: BackoffStrategy::Custom,
            base_delay_ms,
            formula: Some(formula.into()),
            ..Self::default()
        }
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn with_jitter(mut self, jitter: JitterKind) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Source of uniform samples in [0, 1)
pub trait RandomSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Constant sample, for deterministic jitter
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// fib(1) = fib(2) = 1
pub fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

/// Computes retry delays for a backoff configuration
#[derive(Clone)]
pub struct BackoffCalculator {
    random: Arc<dyn RandomSource>,
}

impl BackoffCalculator {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self { random }
    }

    /// Delay before retry number `attempt` (1-indexed), pre-jitter and unclamped
    pub fn raw_delay(&self, config: &BackoffConfig, attempt: u32) -> f64 {
        let attempt = attempt.max(1);
        let base = config.base_delay_ms as f64;
        match config.strategy {
            BackoffStrategy::Immediate => 0.0,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => {
                base * config.multiplier.powi(attempt as i32 - 1)
            }
            BackoffStrategy::Fibonacci => base * fibonacci(attempt),
            BackoffStrategy::Polynomial => base * (attempt as f64).powf(config.multiplier),
            BackoffStrategy::Custom => self.custom_delay(config, attempt),
        }
    }

    fn custom_delay(&self, config: &BackoffConfig, attempt: u32) -> f64 {
        let base = config.base_delay_ms as f64;
        let Some(source) = config.formula.as_deref() else {
            warn!("Custom backoff without a formula, using base delay");
            return base;
        };
        let result = Formula::parse(source).and_then(|formula| {
            formula.eval(FormulaVars {
                attempt: attempt as f64,
                base_delay: base,
            })
        });
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(formula = source, error = %e, "Custom backoff formula failed, using base delay");
                base
            }
        }
    }

    /// Clamped delay before jitter
    pub fn clamped_delay(&self, config: &BackoffConfig, attempt: u32) -> f64 {
        let raw = self.raw_delay(config, attempt);
        match config.max_delay_ms {
            Some(max) => raw.min(max as f64),
            None => raw,
        }
    }

    /// Final delay in milliseconds
    pub fn delay_ms(&self, config: &BackoffConfig, attempt: u32) -> u64 {
        let delay = self.clamped_delay(config, attempt);
        let jittered = match config.jitter {
            JitterKind::None => delay,
            JitterKind::Uniform => delay + self.random.sample() * 0.25 * delay,
            JitterKind::Exponential => delay * self.random.sample(),
        };
        if jittered.is_nan() {
            return config.base_delay_ms;
        }
        if jittered == f64::INFINITY {
            return config.max_delay_ms.unwrap_or(u64::MAX);
        }
        // `as` saturates above u64::MAX
        jittered.max(0.0).round() as u64
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRandom))
    }
}

impl std::fmt::Debug for BackoffCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffCalculator").finish_non_exhaustive()
    }
}
