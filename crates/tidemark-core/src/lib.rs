//! Tidemark Core - Data model for the sensor aggregation job
//!
//! This crate holds the wire-level reading model, the closed-window result
//! row, and the timestamp interpretation policy shared by the runtime and
//! the CLI.

pub mod reading;
pub mod stats;
pub mod time;

pub use reading::{ReadingError, SensorReading};
pub use stats::WindowStat;
pub use time::TimestampZone;
