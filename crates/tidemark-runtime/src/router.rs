//! Key routing: composite device key to processing lane.
//!
//! All readings for the same `template_id`/`device_id` pair must land on the
//! same lane so that lane can mutate the key's window state without
//! cross-lane coordination. FxHasher is deterministic, so placement is also
//! stable across restarts of the same build.

use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use tidemark_core::SensorReading;

/// Error for readings that cannot be keyed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("reading has empty template_id")]
    EmptyTemplateId,
    #[error("reading has empty device_id")]
    EmptyDeviceId,
}

/// Maps readings onto one of `lanes` independent processing lanes.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    lanes: usize,
}

impl KeyRouter {
    pub fn new(lanes: usize) -> Self {
        assert!(lanes > 0, "router needs at least one lane");
        Self { lanes }
    }

    /// The composite key grouping readings from one device under one template.
    pub fn composite_key(reading: &SensorReading) -> Result<String, RouteError> {
        if reading.template_id.is_empty() {
            return Err(RouteError::EmptyTemplateId);
        }
        if reading.device_id.is_empty() {
            return Err(RouteError::EmptyDeviceId);
        }
        Ok(format!("{}_{}", reading.template_id, reading.device_id))
    }

    /// Route a reading to its lane. Same key, same lane, always.
    pub fn route(&self, reading: &SensorReading) -> Result<usize, RouteError> {
        let key = Self::composite_key(reading)?;
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        Ok((hasher.finish() % self.lanes as u64) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(template: &str, device: &str) -> SensorReading {
        SensorReading {
            template_id: template.into(),
            device_id: device.into(),
            sensor_value: None,
            timestamp: None,
            location: None,
            status: None,
        }
    }

    #[test]
    fn test_composite_key_format() {
        let key = KeyRouter::composite_key(&reading("T1", "D1")).unwrap();
        assert_eq!(key, "T1_D1");
    }

    #[test]
    fn test_same_key_same_lane() {
        let router = KeyRouter::new(4);
        let first = router.route(&reading("T1", "D1")).unwrap();
        for _ in 0..10 {
            assert_eq!(router.route(&reading("T1", "D1")).unwrap(), first);
        }
    }

    #[test]
    fn test_lane_index_in_range() {
        let router = KeyRouter::new(3);
        for i in 0..100 {
            let lane = router
                .route(&reading("T1", &format!("D{}", i)))
                .unwrap();
            assert!(lane < 3);
        }
    }

    #[test]
    fn test_keys_spread_across_lanes() {
        let router = KeyRouter::new(4);
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(router.route(&reading("T1", &format!("D{}", i))).unwrap());
        }
        assert!(seen.len() > 1, "all keys hashed to a single lane");
    }

    #[test]
    fn test_empty_ids_rejected() {
        let router = KeyRouter::new(2);
        assert_eq!(
            router.route(&reading("", "D1")),
            Err(RouteError::EmptyTemplateId)
        );
        assert_eq!(
            router.route(&reading("T1", "")),
            Err(RouteError::EmptyDeviceId)
        );
    }

    #[test]
    fn test_single_lane_routes_everything() {
        let router = KeyRouter::new(1);
        for i in 0..20 {
            assert_eq!(router.route(&reading("T", &format!("D{}", i))).unwrap(), 0);
        }
    }
}
