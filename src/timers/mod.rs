//! Durable wait-window timers.
//!
//! One timer per correlation key. Rows persist across restarts and are
//! fired by [`scheduler::run`], which re-enters the coordinator exactly like
//! an upstream event would.

pub mod scheduler;
mod store;

use crate::coordinator::CorrelationKey;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub use store::SqliteTimerService;

pub trait TimerService: Send + Sync {
    /// Arm the timer for `key` at `fire_at`. Arming an already-armed key is a
    /// no-op; the returned deadline is whichever one is in effect.
    fn arm_at(&self, key: &CorrelationKey, fire_at: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Safe to call when nothing is armed.
    fn cancel(&self, key: &CorrelationKey) -> Result<()>;

    fn deadline(&self, key: &CorrelationKey) -> Result<Option<DateTime<Utc>>>;

    /// Keys whose deadline is at or before `now`, soonest first.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<CorrelationKey>>;

    fn arm(&self, key: &CorrelationKey, delay: Duration) -> Result<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(delay).context("Timer delay out of range")?;
        self.arm_at(key, Utc::now() + delay)
    }
}
