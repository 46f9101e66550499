//! Per-window aggregation.
//!
//! The reduction applied to readings landing in the same window is pluggable
//! behind the `Aggregator` trait; the shipped implementation counts readings.

use crate::window::WindowState;
use tidemark_core::SensorReading;

/// Incremental reduction over the readings assigned to one window.
///
/// `apply` is called once per reading, on the lane's thread, for each window
/// the reading lands in. Implementations must be cheap: this is the hot path.
pub trait Aggregator: Send + Sync {
    fn apply(&self, state: &mut WindowState, reading: &SensorReading);
}

/// Counts readings per window.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountAggregator;

impl Aggregator for CountAggregator {
    fn apply(&self, state: &mut WindowState, _reading: &SensorReading) {
        state.count += 1;
    }
}
