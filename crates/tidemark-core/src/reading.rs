//! Wire model for incoming sensor readings.

use crate::time::{self, TimestampZone};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single sensor reading as received from the message source.
///
/// Immutable once parsed. The `timestamp` field is the device's wall clock
/// in `yyyy-MM-dd HH:mm:ss` format; it may be absent, in which case the
/// pipeline falls back to ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub template_id: String,
    pub device_id: String,
    #[serde(default)]
    pub sensor_value: Option<f64>,
    #[serde(default, with = "time::opt_wire_timestamp")]
    pub timestamp: Option<NaiveDateTime>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Error raised for readings that cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum ReadingError {
    #[error("malformed reading: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl SensorReading {
    /// Parse a reading from a raw JSON payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, ReadingError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Event time of this reading on the UTC axis.
    ///
    /// Applies the configured zone policy to the device timestamp, or falls
    /// back to the supplied ingestion time when the timestamp is absent.
    pub fn event_time(&self, zone: TimestampZone, ingested_at: DateTime<Utc>) -> DateTime<Utc> {
        match self.timestamp {
            Some(naive) => zone.resolve(naive),
            None => ingested_at,
        }
    }
}
