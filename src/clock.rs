//! Clock abstraction (spec §9, "scattered clock reads"): every component
//! that stamps a timestamp or computes a staleness threshold reads the
//! time through this trait instead of calling `Utc::now()` directly, so
//! health-supervisor thresholds and session timestamps are deterministic
//! in tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock whose value is advanced manually, for deterministic tests of
/// stuck-session detection and timestamp monotonicity.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.inner.lock();
        *guard += duration;
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *self.inner.lock() = value;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock()
    }
}
