//! Strictly increasing wall-clock timestamps.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use replimap_types::Timestamp;

/// Hands out microsecond timestamps that never repeat and never go backwards,
/// even when the wall clock does.
#[derive(Debug, Default)]
pub(crate) struct Clock {
    last: AtomicU64,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns a timestamp greater than every one issued before and greater
    /// than `floor`.
    pub(crate) fn after(&self, floor: Timestamp) -> Timestamp {
        let wall = Utc::now().timestamp_micros().max(0) as u64;
        let next = |last: u64| wall.max(last + 1).max(floor + 1);

        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(next(last)))
        {
            Ok(prev) | Err(prev) => next(prev),
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.after(0)
    }

    /// The most recently issued timestamp.
    pub(crate) fn peek(&self) -> Timestamp {
        self.last.load(Ordering::Acquire)
    }

    /// Makes sure later timestamps exceed `timestamp`.
    pub(crate) fn observe(&self, timestamp: Timestamp) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_strictly_increase() {
        let clock = Clock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(clock.peek(), prev);
    }

    #[test]
    fn test_floor_is_respected() {
        let clock = Clock::new();
        let far_future = clock.now() + 60_000_000;
        assert_eq!(clock.after(far_future), far_future + 1);
        assert!(clock.now() > far_future + 1);
    }

    #[test]
    fn test_observe_pushes_clock_forward() {
        let clock = Clock::new();
        let ahead = clock.now() + 5_000_000;
        clock.observe(ahead);
        assert!(clock.now() > ahead);
    }
}
