//! Sliding retry budgets per (policy, project)
//!
//! Each budget holds an hourly and a daily window. Windows reset lazily:
//! [`BudgetWindow::advance`] is a pure function of the stored window and
//! `now`, so resetting is idempotent no matter how often it is read.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Hourly and daily retry limits of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudgetLimits {
    pub max_per_hour: u32,
    pub max_per_day: u32,
}

impl RetryBudgetLimits {
    pub fn new(max_per_hour: u32, max_per_day: u32) -> Self {
        Self {
            max_per_hour,
            max_per_day,
        }
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_per_hour == 0 {
            problems.push("retry_budget.max_per_hour must be at least 1".to_string());
        }
        if self.max_per_day == 0 {
            problems.push("retry_budget.max_per_day must be at least 1".to_string());
        }
        problems
    }
}

/// A counter that resets when its window elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWindow {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

impl BudgetWindow {
    pub fn starting(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            count: 0,
            reset_at: now + length,
        }
    }

    /// The window as seen at `now`.
    ///
    /// When `now >= reset_at` the count is zeroed and `reset_at` moves
    /// forward by whole windows until it lies after `now`.
    pub fn advance(self, now: DateTime<Utc>, length: Duration) -> Self {
        if now < self.reset_at {
            return self;
        }
        let length_ms = length.num_milliseconds().max(1);
        let behind_ms = (now - self.reset_at).num_milliseconds();
        let windows = behind_ms / length_ms + 1;
        Self {
            count: 0,
            reset_at: self.reset_at + Duration::milliseconds(windows * length_ms),
        }
    }

    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }
}

/// Budget state for one (policy, project) key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudgetState {
    pub hourly: BudgetWindow,
    pub daily: BudgetWindow,
}

/// Budget check result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub allowed: bool,
    pub hourly_used: u32,
    pub hourly_remaining: u32,
    pub daily_used: u32,
    pub daily_remaining: u32,
    pub hourly_reset_at: DateTime<Utc>,
    pub daily_reset_at: DateTime<Utc>,
}

impl RetryBudgetState {
    pub fn hour() -> Duration {
        Duration::hours(1)
    }

    pub fn day() -> Duration {
        Duration::days(1)
    }

    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hourly: BudgetWindow::starting(now, Self::hour()),
            daily: BudgetWindow::starting(now, Self::day()),
        }
    }

    /// Apply lazy resets for `now`
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.hourly = self.hourly.advance(now, Self::hour());
        self.daily = self.daily.advance(now, Self::day());
    }

    /// Reset elapsed windows and compare against the limits
    pub fn check(&mut self, limits: &RetryBudgetLimits, now: DateTime<Utc>) -> BudgetStatus {
        self.advance(now);
        self.status(limits)
    }

    /// Count one dispatched retry on both windows
    pub fn consume(&mut self, now: DateTime<Utc>) {
        self.advance(now);
        self.hourly.count = self.hourly.count.saturating_add(1);
        self.daily.count = self.daily.count.saturating_add(1);
    }

    pub fn status(&self, limits: &RetryBudgetLimits) -> BudgetStatus {
        let hourly_remaining = self.hourly.remaining(limits.max_per_hour);
        let daily_remaining = self.daily.remaining(limits.max_per_day);
        BudgetStatus {
            allowed: hourly_remaining > 0 && daily_remaining > 0,
            hourly_used: self.hourly.count,
            hourly_remaining,
            daily_used: self.daily.count,
            daily_remaining,
            hourly_reset_at: self.hourly.reset_at,
            daily_reset_at: self.daily.reset_at,
        }
    }
}
