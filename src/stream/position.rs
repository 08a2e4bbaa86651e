//! Mark and period position tracking
//!
//! Frame totals only grow. A mark fires once when the total reaches it and
//! stays quiet until set again. A period fires once for every full period
//! accumulated and keeps the remainder, so spacing never drifts.

use serde::{Deserialize, Serialize};

/// What a transfer triggered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionEvents {
    pub mark: Option<u64>,
    pub period: Option<u64>,
    pub period_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionTracker {
    total_frames: u64,
    mark: Option<u64>,
    mark_fired: bool,
    period: Option<u64>,
    accumulated: u64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn mark(&self) -> Option<u64> {
        self.mark
    }

    pub fn period(&self) -> Option<u64> {
        self.period
    }

    /// Frames counted towards the next period
    pub fn accumulated(&self) -> u64 {
        self.accumulated
    }

    /// Arm a mark. Re-arming clears the fired flag.
    pub fn set_mark(&mut self, mark: u64) {
        self.mark = Some(mark);
        self.mark_fired = false;
    }

    pub fn unset_mark(&mut self) {
        self.mark = None;
        self.mark_fired = false;
    }

    /// Arm a period, seeded with the frames already past the last multiple
    pub fn set_period(&mut self, period: u64) {
        let period = period.max(1);
        self.period = Some(period);
        self.accumulated = self.total_frames % period;
    }

    pub fn unset_period(&mut self) {
        self.period = None;
        self.accumulated = 0;
    }

    pub fn advance(&mut self, frames: u64) -> PositionEvents {
        let mut events = PositionEvents::default();
        if frames == 0 {
            return events;
        }
        self.total_frames += frames;

        if let Some(mark) = self.mark {
            if !self.mark_fired && self.total_frames >= mark {
                self.mark_fired = true;
                events.mark = Some(mark);
            }
        }

        if let Some(period) = self.period {
            self.accumulated += frames;
            if self.accumulated >= period {
                events.period = Some(period);
                events.period_count = self.accumulated / period;
                self.accumulated %= period;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mark_fires_once_per_arm() {
        let mut tracker = PositionTracker::new();
        tracker.set_mark(100);
        assert_eq!(tracker.advance(60).mark, None);
        assert_eq!(tracker.advance(40).mark, Some(100));
        assert_eq!(tracker.advance(100).mark, None);

        tracker.set_mark(150);
        assert_eq!(tracker.advance(1).mark, Some(150));
        tracker.unset_mark();
        assert_eq!(tracker.advance(1000).mark, None);
    }

    #[test]
    fn test_period_three_and_a_half() {
        let mut tracker = PositionTracker::new();
        tracker.set_period(100);
        let fired: u64 = (0..7).map(|_| tracker.advance(50).period_count).sum();
        assert_eq!(fired, 3);
        assert_eq!(tracker.accumulated(), 50);
    }

    #[test]
    fn test_period_seeded_from_total() {
        let mut tracker = PositionTracker::new();
        tracker.advance(250);
        tracker.set_period(100);
        assert_eq!(tracker.accumulated(), 50);
        assert_eq!(tracker.advance(50).period_count, 1);
    }

    #[test]
    fn test_one_large_transfer_fires_per_multiple() {
        let mut tracker = PositionTracker::new();
        tracker.set_period(10);
        let events = tracker.advance(35);
        assert_eq!(events.period, Some(10));
        assert_eq!(events.period_count, 3);
        assert_eq!(tracker.accumulated(), 5);
    }

    proptest! {
        #[test]
        fn prop_period_count_matches_division(
            period in 1u64..500,
            chunks in proptest::collection::vec(0u64..1000, 0..50),
        ) {
            let mut tracker = PositionTracker::new();
            tracker.set_period(period);
            let fired: u64 = chunks.iter().map(|c| tracker.advance(*c).period_count).sum();
            let total: u64 = chunks.iter().sum();
            prop_assert_eq!(fired, total / period);
            prop_assert_eq!(tracker.accumulated(), total % period);
            prop_assert_eq!(tracker.total_frames(), total);
        }

        #[test]
        fn prop_mark_fires_at_most_once(
            mark in 1u64..5000,
            chunks in proptest::collection::vec(1u64..300, 1..60),
        ) {
            let mut tracker = PositionTracker::new();
            tracker.set_mark(mark);
            let fired = chunks.iter().filter(|c| tracker.advance(**c).mark.is_some()).count();
            let total: u64 = chunks.iter().sum();
            prop_assert_eq!(fired, usize::from(total >= mark));
        }
    }
}
