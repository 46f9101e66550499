//! Closed-window result rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Count aggregate for one device key over one window instance.
///
/// This is the unit the sink persists. Two stats with the same
/// `(template_id, device_id, window_start, window_end)` describe the same
/// window and must replace each other on write, never accumulate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStat {
    pub template_id: String,
    pub device_id: String,
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl WindowStat {
    /// The idempotency key the sink's storage enforces uniqueness on.
    pub fn conflict_key(&self) -> (&str, &str, i64, i64) {
        (
            &self.template_id,
            &self.device_id,
            self.window_start.timestamp_millis(),
            self.window_end.timestamp_millis(),
        )
    }
}

impl std::fmt::Display for WindowStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{} [{} .. {}) count={}",
            self.template_id,
            self.device_id,
            self.window_start.format("%H:%M:%S"),
            self.window_end.format("%H:%M:%S"),
            self.count
        )
    }
}
