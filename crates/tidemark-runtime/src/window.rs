//! Sliding event-time windows, keyed by device.
//!
//! Each lane owns one `WindowManager`: an arena of `WindowKey → WindowState`
//! entries mutated only by that lane. Windows are created lazily when the
//! first reading lands in them and destroyed when the watermark passes their
//! end. An event at time `t` belongs to every window `[w*slide, w*slide + size)`
//! containing `t`, i.e. `ceil(size/slide)` windows per event.

use crate::aggregate::Aggregator;
use crate::checkpoint::{LaneCheckpoint, WindowStateCheckpoint};
use crate::watermark::WatermarkTracker;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use tidemark_core::{SensorReading, WindowStat};
use tracing::trace;

/// Sliding window geometry.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub size: Duration,
    pub slide: Duration,
}

/// Identifies one window instance for one device key.
///
/// `window_end` is derived: `window_start + size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub template_id: String,
    pub device_id: String,
    pub window_start_ms: i64,
}

/// Aggregate state of one open window. Single-writer: the owning lane.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowState {
    pub count: u64,
    pub last_event_time: DateTime<Utc>,
}

/// Outcome of offering a reading to the window manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// The reading was applied to this many windows.
    Applied(usize),
    /// The reading was older than the lateness cutoff and dropped.
    Late,
}

/// Per-lane window state machine.
pub struct WindowManager {
    size_ms: i64,
    slide_ms: i64,
    tracker: WatermarkTracker,
    states: FxHashMap<WindowKey, WindowState>,
    aggregator: Arc<dyn Aggregator>,
    late_dropped: u64,
}

impl WindowManager {
    pub fn new(
        config: WindowConfig,
        allowed_lateness: Duration,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        let size_ms = config.size.num_milliseconds();
        let slide_ms = config.slide.num_milliseconds();
        assert!(size_ms > 0, "window size must be positive");
        assert!(slide_ms > 0, "window slide must be positive");

        Self {
            size_ms,
            slide_ms,
            tracker: WatermarkTracker::new(allowed_lateness),
            states: FxHashMap::default(),
            aggregator,
            late_dropped: 0,
        }
    }

    /// Offer a reading at its resolved event time.
    ///
    /// Advances the watermark, drops the reading if it is older than the
    /// lateness cutoff, otherwise applies the aggregator to every window the
    /// reading belongs to (creating windows lazily).
    pub fn on_event(&mut self, reading: &SensorReading, event_time: DateTime<Utc>) -> Assignment {
        self.tracker.observe(event_time);

        if let Some(bound) = self.tracker.late_bound() {
            if event_time < bound {
                self.late_dropped += 1;
                trace!(
                    event_time = %event_time,
                    bound = %bound,
                    "dropped late reading"
                );
                return Assignment::Late;
            }
        }

        let starts = self.window_starts(event_time.timestamp_millis());
        for start_ms in &starts {
            let key = WindowKey {
                template_id: reading.template_id.clone(),
                device_id: reading.device_id.clone(),
                window_start_ms: *start_ms,
            };
            let state = self.states.entry(key).or_insert(WindowState {
                count: 0,
                last_event_time: event_time,
            });
            self.aggregator.apply(state, reading);
            state.last_event_time = event_time;
        }
        Assignment::Applied(starts.len())
    }

    /// Close every window whose end the watermark has passed.
    ///
    /// Closed windows leave the active set and are returned in ascending
    /// window-end order (ties broken by key) so downstream writes stay
    /// roughly time-ordered.
    pub fn on_watermark_advance(&mut self) -> Vec<WindowStat> {
        let Some(wm) = self.tracker.current() else {
            return Vec::new();
        };
        let wm_ms = wm.timestamp_millis();

        let mut ready: Vec<WindowKey> = self
            .states
            .keys()
            .filter(|k| k.window_start_ms + self.size_ms <= wm_ms)
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.window_start_ms
                .cmp(&b.window_start_ms)
                .then_with(|| a.template_id.cmp(&b.template_id))
                .then_with(|| a.device_id.cmp(&b.device_id))
        });

        ready
            .into_iter()
            .filter_map(|key| {
                let state = self.states.remove(&key)?;
                Some(WindowStat {
                    window_start: DateTime::from_timestamp_millis(key.window_start_ms)?,
                    window_end: DateTime::from_timestamp_millis(key.window_start_ms + self.size_ms)?,
                    template_id: key.template_id,
                    device_id: key.device_id,
                    count: state.count,
                })
            })
            .collect()
    }

    /// Start timestamps of every window containing `t_ms`, newest first.
    fn window_starts(&self, t_ms: i64) -> SmallVec<[i64; 4]> {
        let mut starts = SmallVec::new();
        let mut start = t_ms - t_ms.rem_euclid(self.slide_ms);
        while start > t_ms - self.size_ms {
            starts.push(start);
            start -= self.slide_ms;
        }
        starts
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.tracker.current()
    }

    pub fn active_windows(&self) -> usize {
        self.states.len()
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    /// Snapshot this lane's full state.
    pub fn checkpoint(&self) -> LaneCheckpoint {
        let mut windows: Vec<WindowStateCheckpoint> = self
            .states
            .iter()
            .map(|(key, state)| WindowStateCheckpoint {
                template_id: key.template_id.clone(),
                device_id: key.device_id.clone(),
                window_start_ms: key.window_start_ms,
                count: state.count,
                last_event_time_ms: state.last_event_time.timestamp_millis(),
            })
            .collect();
        windows.sort_by(|a, b| {
            a.window_start_ms
                .cmp(&b.window_start_ms)
                .then_with(|| a.template_id.cmp(&b.template_id))
                .then_with(|| a.device_id.cmp(&b.device_id))
        });

        LaneCheckpoint {
            windows,
            watermark: self.tracker.checkpoint(),
            late_dropped: self.late_dropped,
        }
    }

    /// Replace this lane's state with a restored checkpoint.
    pub fn restore(&mut self, cp: &LaneCheckpoint) {
        self.states.clear();
        for w in &cp.windows {
            self.states.insert(
                WindowKey {
                    template_id: w.template_id.clone(),
                    device_id: w.device_id.clone(),
                    window_start_ms: w.window_start_ms,
                },
                WindowState {
                    count: w.count,
                    last_event_time: DateTime::from_timestamp_millis(w.last_event_time_ms)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                },
            );
        }
        self.tracker.restore(&cp.watermark);
        self.late_dropped = cp.late_dropped;
    }
}
