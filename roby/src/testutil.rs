// Licensed under the Apache License, Version 2.0.

//! Test doubles: an advanceable [`TestClock`] and a recording [`LogSink`], so tests can assert on
//! structural events without scraping `log` output. Not used by any non-test code; kept behind
//! `pub mod testutil` (not `#[cfg(test)]`) so downstream crates' own tests can use it too, the way
//! the teacher's `testutil` crates are ordinary non-test-gated library crates.

use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::clock::Clock;
use crate::logging::{LogEvent, LogSink};

/// A clock whose `now`/`wall_time` only move when `advance` is called.
pub struct TestClock {
    base_instant: Instant,
    base_wall: SystemTime,
    elapsed: Mutex<Duration>,
}

impl TestClock {
    pub fn new() -> Self {
        TestClock {
            base_instant: Instant::now(),
            base_wall: SystemTime::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap();
        *elapsed += by;
    }
}

impl Default for TestClock {
    fn default() -> Self {
        TestClock::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + *self.elapsed.lock().unwrap()
    }

    fn wall_time(&self) -> SystemTime {
        self.base_wall + *self.elapsed.lock().unwrap()
    }
}

/// A [`LogSink`] that records every event it receives, in order, for test assertions.
#[derive(Default)]
pub struct RecordingLogSink {
    events: Vec<LogEvent>,
}

impl RecordingLogSink {
    pub fn new() -> Self {
        RecordingLogSink::default()
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn contains_quarantine(&self, id: crate::ids::PlanObjectId) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, LogEvent::Quarantined(q) if *q == id))
    }
}

impl LogSink for RecordingLogSink {
    fn log(&mut self, event: LogEvent) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_only_moves_on_advance() {
        let clock = TestClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), t0 + Duration::from_secs(1));
    }

    #[test]
    fn recording_sink_preserves_order() {
        let mut sink = RecordingLogSink::new();
        sink.log(LogEvent::GarbageCollectStart);
        sink.log(LogEvent::GarbageCollectEnd {
            finalized: 1,
            quarantined: 0,
        });
        assert_eq!(sink.events().len(), 2);
        assert!(matches!(sink.events()[0], LogEvent::GarbageCollectStart));
    }
}
