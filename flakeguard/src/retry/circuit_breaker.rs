//! Circuit breaker for retries of one test under one policy.
//!
//! The breaker counts reported retry failures. Once failures reach the
//! configured threshold the circuit *opens* and retries for that test are
//! refused. After the recovery timeout it enters *half-open* and admits a
//! limited number of probe retries; the next reported outcome closes or
//! reopens it.
//!
//! ```text
//! Closed ──(failures ≥ threshold)──▶ Open ──(recovery timeout)──▶ HalfOpen
//!   ▲                                  ▲                            │
//!   │                                  └────────(failure)───────────┤
//!   └───────────────────────(success)───────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Circuit state for one (policy, test) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy: retries allowed.
    #[default]
    Closed,
    /// Tripped: retries refused until the recovery timeout expires.
    Open,
    /// Recovery timeout expired: limited probe retries allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker settings of a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Reported failures before the circuit opens.
    pub failure_threshold: u32,
    /// Milliseconds after the last failure before Open → HalfOpen.
    pub recovery_timeout_ms: u64,
    /// Probe retries admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.recovery_timeout_ms).unwrap_or(i64::MAX))
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.enabled {
            if self.failure_threshold == 0 {
                problems.push("circuit_breaker.failure_threshold must be at least 1".to_string());
            }
            if self.half_open_max_calls == 0 {
                problems.push("circuit_breaker.half_open_max_calls must be at least 1".to_string());
            }
        }
        problems
    }
}

/// Persistent breaker state for one key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    pub half_open_call_count: u32,
}

impl CircuitBreakerState {
    /// Whether a retry may proceed at `now`.
    ///
    /// May move Open → HalfOpen once the recovery timeout has elapsed. Does
    /// not consume a half-open probe; see [`Self::reserve_probe`].
    pub fn admit(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Result<(), String> {
        if !config.enabled {
            return Ok(());
        }
        if self.state == CircuitState::Open {
            let elapsed = self
                .last_failure_time
                .map(|t| now - t >= config.recovery_timeout())
                .unwrap_or(true);
            if !elapsed {
                return Err(format!(
                    "Circuit breaker open after {} failures",
                    self.failure_count
                ));
            }
            self.state = CircuitState::HalfOpen;
            self.half_open_call_count = 0;
        }
        if self.state == CircuitState::HalfOpen
            && self.half_open_call_count >= config.half_open_max_calls
        {
            return Err(format!(
                "Circuit breaker half-open, saturated ({} of {} probes in flight)",
                self.half_open_call_count, config.half_open_max_calls
            ));
        }
        Ok(())
    }

    /// Claim a half-open probe slot for an approved retry.
    ///
    /// Returns `false` when the probes are exhausted. Closed circuits always
    /// succeed without counting.
    pub fn reserve_probe(&mut self, config: &CircuitBreakerConfig) -> bool {
        if !config.enabled {
            return true;
        }
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_call_count >= config.half_open_max_calls {
                    return false;
                }
                self.half_open_call_count += 1;
                true
            }
        }
    }

    /// Apply a reported retry outcome
    pub fn record_outcome(&mut self, config: &CircuitBreakerConfig, success: bool, now: DateTime<Utc>) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_call_count += 1;
        }
        if success {
            self.failure_count = 0;
            if self.state == CircuitState::HalfOpen {
                self.state = CircuitState::Closed;
                self.half_open_call_count = 0;
            }
            return;
        }
        self.failure_count += 1;
        self.last_failure_time = Some(now);
        if self.state == CircuitState::HalfOpen
            || (config.enabled && self.failure_count >= config.failure_threshold)
        {
            self.state = CircuitState::Open;
        }
    }

    /// Whether a retry would currently be refused (read-only)
    pub fn is_blocking(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        let mut probe = self.clone();
        probe.admit(config, now).is_err()
    }
}
