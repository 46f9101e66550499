//! Snapshot persistence for recovery.
//!
//! A checkpoint snapshot captures the source read position plus every lane's
//! window and watermark state under one monotonically increasing id. Stores
//! commit atomically: the previous snapshot stays loadable until the new one
//! is fully written.

use crate::connector::SourcePosition;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Format version stamped into every snapshot and checked on load.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One window's aggregate state inside a lane checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStateCheckpoint {
    pub template_id: String,
    pub device_id: String,
    pub window_start_ms: i64,
    pub count: u64,
    pub last_event_time_ms: i64,
}

/// Watermark tracker state inside a lane checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkCheckpoint {
    pub max_seen_ms: Option<i64>,
    pub watermark_ms: Option<i64>,
}

/// Full state of one lane at the barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneCheckpoint {
    pub windows: Vec<WindowStateCheckpoint>,
    pub watermark: WatermarkCheckpoint,
    pub late_dropped: u64,
}

/// A committed snapshot of the whole job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Snapshot id, assigned by the manager (monotonically increasing).
    pub id: u64,
    /// Format version for load-time validation.
    pub version: u32,
    /// Wall-clock commit time in milliseconds.
    pub timestamp_ms: i64,
    /// Number of lanes the snapshot was taken over.
    pub lane_count: usize,
    /// Source position to resume reading from.
    pub source_position: SourcePosition,
    /// Per-lane state, indexed by lane id.
    pub lanes: Vec<LaneCheckpoint>,
}

impl CheckpointSnapshot {
    /// Validate the self-describing fields of a loaded snapshot.
    pub fn validate(&self, expected_lanes: usize) -> Result<(), StoreError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StoreError::Invalid(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        if self.lanes.len() != self.lane_count {
            return Err(StoreError::Invalid(format!(
                "snapshot declares {} lanes but carries {}",
                self.lane_count,
                self.lanes.len()
            )));
        }
        if self.lane_count != expected_lanes {
            return Err(StoreError::Invalid(format!(
                "snapshot was taken with parallelism {} but the job is configured with {}",
                self.lane_count, expected_lanes
            )));
        }
        Ok(())
    }
}

/// Error type for state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid snapshot: {0}")]
    Invalid(String),
}

/// Storage backend for checkpoint snapshots.
pub trait StateStore: Send + Sync {
    /// Persist a snapshot under its id.
    fn save_snapshot(&self, snapshot: &CheckpointSnapshot) -> Result<(), StoreError>;

    /// Load the snapshot with the highest id, if any.
    fn load_latest(&self) -> Result<Option<CheckpointSnapshot>, StoreError>;

    /// Load a specific snapshot by id.
    fn load_snapshot(&self, id: u64) -> Result<Option<CheckpointSnapshot>, StoreError>;

    /// List all stored snapshot ids, ascending.
    fn list_snapshots(&self) -> Result<Vec<u64>, StoreError>;

    /// Delete old snapshots, keeping only the most recent `keep`.
    fn prune_snapshots(&self, keep: usize) -> Result<usize, StoreError>;

    /// Flush pending writes to durable storage.
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory snapshot store for tests.
#[derive(Default)]
pub struct MemoryStore {
    data: std::sync::RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn save_snapshot(&self, snapshot: &CheckpointSnapshot) -> Result<(), StoreError> {
        let data = serde_json::to_vec(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut map = self.data.write().map_err(|e| StoreError::Io(e.to_string()))?;
        map.insert(snapshot.id, data);
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<CheckpointSnapshot>, StoreError> {
        match self.list_snapshots()?.last() {
            Some(id) => self.load_snapshot(*id),
            None => Ok(None),
        }
    }

    fn load_snapshot(&self, id: u64) -> Result<Option<CheckpointSnapshot>, StoreError> {
        let map = self.data.read().map_err(|e| StoreError::Io(e.to_string()))?;
        match map.get(&id) {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn list_snapshots(&self) -> Result<Vec<u64>, StoreError> {
        let map = self.data.read().map_err(|e| StoreError::Io(e.to_string()))?;
        let mut ids: Vec<u64> = map.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn prune_snapshots(&self, keep: usize) -> Result<usize, StoreError> {
        let ids = self.list_snapshots()?;
        let to_delete = ids.len().saturating_sub(keep);
        let mut map = self.data.write().map_err(|e| StoreError::Io(e.to_string()))?;
        for id in ids.iter().take(to_delete) {
            map.remove(id);
        }
        Ok(to_delete)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// File-system snapshot store.
///
/// One file per snapshot under `<dir>/snapshot/<id>`. Writes are atomic via
/// temp file + rename, so a crash mid-write leaves the previous snapshot
/// intact and loadable.
pub struct FileStore {
    dir: std::path::PathBuf,
}

impl FileStore {
    /// Open or create a file-based store at the given directory.
    pub fn open(dir: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("snapshot"))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn snapshot_path(&self, id: u64) -> std::path::PathBuf {
        self.dir.join("snapshot").join(id.to_string())
    }
}

impl StateStore for FileStore {
    fn save_snapshot(&self, snapshot: &CheckpointSnapshot) -> Result<(), StoreError> {
        let data = serde_json::to_vec(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let path = self.snapshot_path(snapshot.id);
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &data).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StoreError::Io(e.to_string()))?;

        debug!(id = snapshot.id, bytes = data.len(), "saved snapshot");
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<CheckpointSnapshot>, StoreError> {
        match self.list_snapshots()?.last() {
            Some(id) => self.load_snapshot(*id),
            None => Ok(None),
        }
    }

    fn load_snapshot(&self, id: u64) -> Result<Option<CheckpointSnapshot>, StoreError> {
        match std::fs::read(self.snapshot_path(id)) {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn list_snapshots(&self) -> Result<Vec<u64>, StoreError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(self.dir.join("snapshot"))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn prune_snapshots(&self, keep: usize) -> Result<usize, StoreError> {
        let ids = self.list_snapshots()?;
        let to_delete = ids.len().saturating_sub(keep);
        for id in ids.iter().take(to_delete) {
            match std::fs::remove_file(self.snapshot_path(*id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e.to_string())),
            }
        }
        Ok(to_delete)
    }

    fn flush(&self) -> Result<(), StoreError> {
        // Writes are renamed into place synchronously; nothing buffered.
        Ok(())
    }
}

/// Assigns snapshot ids, enforces retention, and recovers the latest
/// committed snapshot on startup.
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    max_retained: usize,
    next_id: u64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>, max_retained: usize) -> Result<Self, StoreError> {
        let next_id = store.load_latest()?.map(|s| s.id + 1).unwrap_or(1);
        Ok(Self {
            store,
            max_retained,
            next_id,
        })
    }

    /// Commit a snapshot: assign its id, write it durably, prune old ones.
    ///
    /// The previous snapshot remains valid until the new write completes;
    /// pruning only runs after the new snapshot is flushed.
    pub fn commit(&mut self, mut snapshot: CheckpointSnapshot) -> Result<u64, StoreError> {
        snapshot.id = self.next_id;
        snapshot.timestamp_ms = chrono::Utc::now().timestamp_millis();

        self.store.save_snapshot(&snapshot)?;
        self.store.flush()?;
        self.store.prune_snapshots(self.max_retained)?;

        self.next_id += 1;
        info!(
            id = snapshot.id,
            lanes = snapshot.lane_count,
            position = snapshot.source_position.0,
            "committed checkpoint"
        );
        Ok(snapshot.id)
    }

    /// Load and validate the latest committed snapshot for recovery.
    pub fn recover(&self, expected_lanes: usize) -> Result<Option<CheckpointSnapshot>, StoreError> {
        match self.store.load_latest()? {
            Some(snapshot) => {
                snapshot.validate(expected_lanes)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }
}
