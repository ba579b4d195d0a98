// Licensed under the Apache License, Version 2.0.

//! A monotonic + wall-clock pair, injectable so tests can control time instead of racing the
//! real clock. Grounded in the same split `concrete_time` draws between a monotonic instant (used
//! for ordering and delays) and a wall-clock timestamp (used for display and logging).

use std::time::{Duration, Instant, SystemTime};

/// Clock abstraction consulted by the propagation engine for delayed-signal scheduling and by the
/// `ExecutionEngine` for cycle pacing.
pub trait Clock: Send + Sync {
    /// A monotonically non-decreasing instant, used for delay arithmetic and pacing.
    fn now(&self) -> Instant;

    /// The current wall-clock time, used only for timestamps attached to `Event` records.
    fn wall_time(&self) -> SystemTime;
}

/// Default clock: the operating system's monotonic clock and wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock a test can advance explicitly. See [`crate::testutil::TestClock`] for the full
/// interior-mutable double; this type only fixes the trait's shape against real `Instant`s.
pub fn instant_after(base: Instant, delay: Duration) -> Instant {
    base + delay
}
