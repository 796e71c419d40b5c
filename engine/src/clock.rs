//! Logical clock for ordering collection snapshots.
//!
//! Timestamps are milliseconds since the Unix epoch so that values produced
//! on a device and values assigned by the server compare meaningfully. The
//! clock never hands out a value that is not strictly greater than anything
//! it has already handed out or observed.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A hybrid logical clock.
///
/// `tick` combines wall time with the highest timestamp seen so far, so a
/// device whose wall clock lags the server still produces increasing values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    /// Highest timestamp issued or observed
    pub last: Timestamp,
}

impl LogicalClock {
    /// Create a clock that has observed nothing.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Create a clock that has already observed `last`.
    pub fn starting_at(last: Timestamp) -> Self {
        Self { last }
    }

    /// Issue the next timestamp given the current wall time.
    pub fn tick(&mut self, now: Timestamp) -> Timestamp {
        let next = now.max(self.last.saturating_add(1));
        self.last = next;
        next
    }

    /// Raise the clock to at least `timestamp`.
    /// Used when a remote record or a server-assigned timestamp is seen.
    pub fn observe(&mut self, timestamp: Timestamp) {
        self.last = self.last.max(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = LogicalClock::new();
        assert_eq!(clock.last, 0);
    }

    #[test]
    fn tick_follows_wall_time() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(1_000), 1_000);
        assert_eq!(clock.tick(2_000), 2_000);
    }

    #[test]
    fn tick_is_strictly_increasing_when_wall_time_stalls() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(1_000), 1_000);
        assert_eq!(clock.tick(1_000), 1_001);
        assert_eq!(clock.tick(900), 1_002);
    }

    #[test]
    fn observe_pushes_future_ticks_past_remote() {
        let mut clock = LogicalClock::starting_at(500);
        clock.observe(5_000);
        assert_eq!(clock.tick(1_000), 5_001);
    }

    #[test]
    fn observe_never_moves_backward() {
        let mut clock = LogicalClock::starting_at(5_000);
        clock.observe(10);
        assert_eq!(clock.last, 5_000);
    }

    #[test]
    fn tick_saturates() {
        let mut clock = LogicalClock::starting_at(u64::MAX);
        assert_eq!(clock.tick(0), u64::MAX);
    }

    #[test]
    fn serialization_format() {
        let clock = LogicalClock::starting_at(42);
        let json = serde_json::to_string(&clock).unwrap();
        assert_eq!(json, r#"{"last":42}"#);
    }
}
