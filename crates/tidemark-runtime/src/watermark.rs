//! Event-time watermark tracking.
//!
//! Each lane derives a monotonic lower bound on event time from the
//! timestamps it has observed: `watermark = max_seen - allowed_lateness`.
//! The watermark never recedes; observing an older timestamp is absorbed.

use crate::checkpoint::WatermarkCheckpoint;
use chrono::{DateTime, Duration, Utc};

/// Tracks the event-time watermark for a single lane.
pub struct WatermarkTracker {
    allowed_lateness: Duration,
    max_seen: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness,
            max_seen: None,
            watermark: None,
        }
    }

    /// Observe an event timestamp, advancing the watermark if it is a new
    /// maximum. Returns `true` when the watermark advanced.
    pub fn observe(&mut self, event_time: DateTime<Utc>) -> bool {
        match self.max_seen {
            Some(max) if event_time <= max => return false,
            _ => self.max_seen = Some(event_time),
        }

        let candidate = event_time - self.allowed_lateness;
        match self.watermark {
            Some(wm) if candidate <= wm => false,
            _ => {
                self.watermark = Some(candidate);
                true
            }
        }
    }

    /// Current watermark: no event older than this is still expected.
    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Cutoff below which events are dropped as late.
    pub fn late_bound(&self) -> Option<DateTime<Utc>> {
        self.watermark.map(|wm| wm - self.allowed_lateness)
    }

    /// Snapshot the tracker state for a checkpoint.
    pub fn checkpoint(&self) -> WatermarkCheckpoint {
        WatermarkCheckpoint {
            max_seen_ms: self.max_seen.map(|t| t.timestamp_millis()),
            watermark_ms: self.watermark.map(|t| t.timestamp_millis()),
        }
    }

    /// Restore tracker state from a checkpoint.
    pub fn restore(&mut self, cp: &WatermarkCheckpoint) {
        self.max_seen = cp.max_seen_ms.and_then(DateTime::from_timestamp_millis);
        self.watermark = cp.watermark_ms.and_then(DateTime::from_timestamp_millis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(secs * 1000).unwrap()
    }

    #[test]
    fn test_watermark_lags_by_allowed_lateness() {
        let mut tracker = WatermarkTracker::new(Duration::seconds(10));
        tracker.observe(ts(100));
        assert_eq!(tracker.current(), Some(ts(90)));
        assert_eq!(tracker.late_bound(), Some(ts(80)));
    }

    #[test]
    fn test_watermark_never_recedes() {
        let mut tracker = WatermarkTracker::new(Duration::seconds(10));
        assert!(tracker.observe(ts(100)));
        let wm = tracker.current();

        // Older and equal timestamps are absorbed
        assert!(!tracker.observe(ts(50)));
        assert!(!tracker.observe(ts(100)));
        assert_eq!(tracker.current(), wm);
    }

    #[test]
    fn test_watermark_monotonic_over_shuffled_sequence() {
        let mut tracker = WatermarkTracker::new(Duration::seconds(5));
        let mut last = None;
        for secs in [30, 10, 45, 44, 46, 2, 100, 99] {
            tracker.observe(ts(secs));
            let wm = tracker.current();
            assert!(wm >= last, "watermark receded at t={}", secs);
            last = wm;
        }
        assert_eq!(tracker.current(), Some(ts(95)));
    }

    #[test]
    fn test_empty_tracker_has_no_watermark() {
        let tracker = WatermarkTracker::new(Duration::seconds(10));
        assert!(tracker.current().is_none());
        assert!(tracker.late_bound().is_none());
    }

    #[test]
    fn test_checkpoint_restore_roundtrip() {
        let mut tracker = WatermarkTracker::new(Duration::seconds(10));
        tracker.observe(ts(100));
        let cp = tracker.checkpoint();

        let mut restored = WatermarkTracker::new(Duration::seconds(10));
        restored.restore(&cp);
        assert_eq!(restored.current(), tracker.current());

        // A restored tracker keeps clamping against the restored maximum
        assert!(!restored.observe(ts(50)));
        assert_eq!(restored.current(), Some(ts(90)));
    }
}
