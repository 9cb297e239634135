//! Deterministic clock for build log tests.

use std::sync::{Mutex, PoisonError};

use polyflow::build_log::Clock;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

/// Returns `start`, then advances by `step` on every call.
pub struct StepClock {
    next: Mutex<OffsetDateTime>,
    step: Duration,
}

impl StepClock {
    /// A clock starting at `start`.
    pub const fn new(start: OffsetDateTime, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }

    /// The instant the next call to [`Clock::now`] will return.
    pub fn peek(&self) -> OffsetDateTime {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StepClock {
    /// Midnight on 2025-01-01 UTC, one minute per call.
    fn default() -> Self {
        Self::new(datetime!(2025-01-01 0:00 UTC), Duration::minutes(1))
    }
}

impl Clock for StepClock {
    fn now(&self) -> OffsetDateTime {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let now = *next;
        *next = now + self.step;
        now
    }
}
