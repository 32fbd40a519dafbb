//! Time sources used by throttling, cooldown and backoff.
//!
//! Injected as traits so orchestration timing is testable without real sleeps.

use crate::sync::cancel::CancelToken;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Wall clock in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Blocking delay that gives up early when the token is cancelled.
pub trait Sleeper: Send + Sync {
    /// Returns `false` when the sleep was interrupted by cancellation.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Sleeps on the calling thread in short slices, polling the cancel token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !cancel.is_cancelled()
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: Mutex::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        if let Ok(mut now) = self.now_ms.lock() {
            *now = now.saturating_add(delta);
        }
    }

    pub fn set(&self, value_ms: i64) {
        if let Ok(mut now) = self.now_ms.lock() {
            *now = value_ms;
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.lock().map(|now| *now).unwrap_or(0)
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    requested: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in call order.
    pub fn requested(&self) -> Vec<Duration> {
        self.requested
            .lock()
            .map(|requested| requested.clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.requested().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(duration);
        }
        !cancel.is_cancelled()
    }
}
