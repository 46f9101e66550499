//! Timestamp parsing and timezone interpretation.
//!
//! Readings carry wall-clock timestamps in `yyyy-MM-dd HH:mm:ss` format with
//! no zone designator. How that local time maps onto the event-time axis is
//! an explicit configuration choice (`TimestampZone`), never inferred from
//! the host environment.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Wire format for reading timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Policy for interpreting the naive wall-clock timestamps on readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampZone {
    /// Treat reading timestamps as UTC.
    #[default]
    Utc,
    /// Treat reading timestamps as local to a fixed offset (e.g. `+08:00`).
    Fixed(FixedOffset),
}

impl TimestampZone {
    /// Map a naive reading timestamp onto the UTC event-time axis.
    pub fn resolve(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self {
            TimestampZone::Utc => Utc.from_utc_datetime(&naive),
            TimestampZone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .unwrap_or_else(|| offset.from_utc_datetime(&naive))
                .with_timezone(&Utc),
        }
    }
}

impl fmt::Display for TimestampZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampZone::Utc => write!(f, "utc"),
            TimestampZone::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

impl FromStr for TimestampZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("utc") {
            return Ok(TimestampZone::Utc);
        }
        s.parse::<FixedOffset>()
            .map(TimestampZone::Fixed)
            .map_err(|e| format!("invalid timestamp zone '{}': {}", s, e))
    }
}

impl Serialize for TimestampZone {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimestampZone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `Option<NaiveDateTime>` in the wire timestamp format.
pub mod opt_wire_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_utc_resolution_is_identity() {
        let ts = naive(12, 0, 0);
        let resolved = TimestampZone::Utc.resolve(ts);
        assert_eq!(resolved.naive_utc(), ts);
    }

    #[test]
    fn test_fixed_offset_shifts_to_utc() {
        let zone: TimestampZone = "+08:00".parse().unwrap();
        let resolved = zone.resolve(naive(12, 0, 0));
        // 12:00 at +08:00 is 04:00 UTC
        assert_eq!(resolved.naive_utc(), naive(4, 0, 0));
    }

    #[test]
    fn test_zone_parse_roundtrip() {
        for raw in ["utc", "+08:00", "-05:00"] {
            let zone: TimestampZone = raw.parse().unwrap();
            let again: TimestampZone = zone.to_string().parse().unwrap();
            assert_eq!(zone, again);
        }
    }

    #[test]
    fn test_zone_parse_rejects_garbage() {
        assert!("Asia/Shanghai".parse::<TimestampZone>().is_err());
        assert!("".parse::<TimestampZone>().is_err());
    }
}
