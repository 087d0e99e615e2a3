//! Circuit breaker and budget state, locked per key
//!
//! Every update runs a closure against the state of a single key while that
//! key's lock is held, so concurrent evaluations for the same (policy, test)
//! or (policy, project) are serialized and unrelated keys never contend.
//!
//! [`InMemoryRetryState`] is per process. Several instances sharing one
//! deployment need a backend with atomic per-key updates behind the same
//! trait, or routing that pins a key to one instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use super::budget::RetryBudgetState;
use super::circuit_breaker::CircuitBreakerState;
use crate::state::{StoreError, StoreResult};

/// Keyed breaker and budget state with single-writer-per-key updates
pub trait RetryStateStore: Send + Sync {
    /// Run `update` on the breaker for `key`, creating a closed breaker if absent
    fn update_breaker(
        &self,
        key: &str,
        update: &mut dyn FnMut(&mut CircuitBreakerState),
    ) -> StoreResult<()>;

    /// Run `update` on the budget for `key`, creating one starting at `now` if absent
    fn update_budget(
        &self,
        key: &str,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut RetryBudgetState),
    ) -> StoreResult<()>;

    fn breaker(&self, key: &str) -> StoreResult<Option<CircuitBreakerState>>;

    fn budget(&self, key: &str) -> StoreResult<Option<RetryBudgetState>>;
}

type Slots<T> = RwLock<HashMap<String, Arc<Mutex<T>>>>;

/// In-process retry state
#[derive(Default)]
pub struct InMemoryRetryState {
    breakers: Slots<CircuitBreakerState>,
    budgets: Slots<RetryBudgetState>,
}

impl InMemoryRetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of breaker keys created so far
    pub fn breaker_count(&self) -> usize {
        self.breakers.read().map(|m| m.len()).unwrap_or(0)
    }
}

/// Get or create the slot for `key`; the map lock is released before returning
fn slot<T>(
    slots: &Slots<T>,
    key: &str,
    init: impl FnOnce() -> T,
) -> StoreResult<Arc<Mutex<T>>> {
    if let Some(existing) = slots
        .read()
        .map_err(|_| StoreError::LockPoisoned)?
        .get(key)
    {
        return Ok(existing.clone());
    }
    let mut map = slots.write().map_err(|_| StoreError::LockPoisoned)?;
    Ok(map
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(init())))
        .clone())
}

fn snapshot<T: Clone>(slots: &Slots<T>, key: &str) -> StoreResult<Option<T>> {
    let entry = slots
        .read()
        .map_err(|_| StoreError::LockPoisoned)?
        .get(key)
        .cloned();
    match entry {
        Some(slot) => {
            let guard = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
            Ok(Some(guard.clone()))
        }
        None => Ok(None),
    }
}

impl RetryStateStore for InMemoryRetryState {
    fn update_breaker(
        &self,
        key: &str,
        update: &mut dyn FnMut(&mut CircuitBreakerState),
    ) -> StoreResult<()> {
        let slot = slot(&self.breakers, key, CircuitBreakerState::default)?;
        let mut state = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
        update(&mut *state);
        Ok(())
    }

    fn update_budget(
        &self,
        key: &str,
        now: DateTime<Utc>,
        update: &mut dyn FnMut(&mut RetryBudgetState),
    ) -> StoreResult<()> {
        let slot = slot(&self.budgets, key, || RetryBudgetState::new(now))?;
        let mut state = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
        update(&mut *state);
        Ok(())
    }

    fn breaker(&self, key: &str) -> StoreResult<Option<CircuitBreakerState>> {
        snapshot(&self.breakers, key)
    }

    fn budget(&self, key: &str) -> StoreResult<Option<RetryBudgetState>> {
        snapshot(&self.budgets, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    #[test]
    fn test_breaker_created_lazily() {
        let store = InMemoryRetryState::new();
        assert!(store.breaker("cb:a").unwrap().is_none());
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        store
            .update_breaker("cb:a", &mut |s| s.record_outcome(&cfg, false, Utc::now()))
            .unwrap();
        assert_eq!(store.breaker("cb:a").unwrap().unwrap().state, CircuitState::Open);
        assert!(store.breaker("cb:b").unwrap().is_none());
        assert_eq!(store.breaker_count(), 1);
    }

    #[test]
    fn test_budget_created_at_first_use() {
        let store = InMemoryRetryState::new();
        let now = Utc::now();
        store.update_budget("budget:p", now, &mut |b| b.consume(now)).unwrap();
        let budget = store.budget("budget:p").unwrap().unwrap();
        assert_eq!(budget.hourly.count, 1);
        assert_eq!(budget.hourly.reset_at, now + chrono::Duration::hours(1));
    }

    #[test]
    fn test_concurrent_updates_serialize_per_key() {
        let store = Arc::new(InMemoryRetryState::new());
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let key = if i % 2 == 0 { "budget:even" } else { "budget:odd" };
                    for _ in 0..250 {
                        store.update_budget(key, now, &mut |b| b.consume(now)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.budget("budget:even").unwrap().unwrap().daily.count, 1000);
        assert_eq!(store.budget("budget:odd").unwrap().unwrap().daily.count, 1000);
    }
}
