//! Source connector traits and error definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidemark_core::SensorReading;
use tokio::sync::mpsc;

/// Opaque read position in the source stream.
///
/// Monotonically increasing; the value carried by a record is the position
/// to resume from so that the record itself is not re-read. For Kafka this
/// is the next offset, for file/memory sources the next record index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SourcePosition(pub u64);

/// One record delivered by a source.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub reading: SensorReading,
    /// Position to resume from after this record.
    pub position: SourcePosition,
}

/// Errors that can occur during connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("connector not available: {0}")]
    NotAvailable(String),
}

/// A source of sensor readings.
///
/// Sources push parsed readings into the channel handed to [`start`]
/// together with their resume position. Malformed payloads are logged and
/// dropped inside the source; they never reach the channel but still advance
/// the position so replay stays consistent.
///
/// [`start`]: SourceConnector::start
#[async_trait]
pub trait SourceConnector: Send {
    fn name(&self) -> &str;

    /// Resume reading from a previously checkpointed position.
    /// Must be called before [`start`](SourceConnector::start).
    fn seek(&mut self, position: SourcePosition);

    /// Start delivering records into `tx`. Spawns background work and
    /// returns once the source is running.
    async fn start(&mut self, tx: mpsc::Sender<SourceRecord>) -> Result<(), ConnectorError>;

    /// Stop delivering records.
    async fn stop(&mut self) -> Result<(), ConnectorError>;

    fn is_running(&self) -> bool;
}
