//! In-memory source for tests and deterministic replay.

use super::types::{ConnectorError, SourceConnector, SourcePosition, SourceRecord};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidemark_core::SensorReading;
use tokio::sync::mpsc;
use tracing::debug;

/// Replays a fixed sequence of readings, honoring `seek`.
///
/// Positions are record indices, so a pipeline restored from a snapshot at
/// position `n` resumes with the `n`-th reading of the sequence, the same
/// contract a real message source provides via offsets.
pub struct MemorySource {
    name: String,
    readings: Arc<Vec<SensorReading>>,
    start_at: SourcePosition,
    running: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new(name: &str, readings: Vec<SensorReading>) -> Self {
        Self {
            name: name.to_string(),
            readings: Arc::new(readings),
            start_at: SourcePosition(0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, position: SourcePosition) {
        self.start_at = position;
    }

    async fn start(&mut self, tx: mpsc::Sender<SourceRecord>) -> Result<(), ConnectorError> {
        self.running.store(true, Ordering::SeqCst);
        let readings = self.readings.clone();
        let running = self.running.clone();
        let skip = self.start_at.0 as usize;
        let name = self.name.clone();

        tokio::spawn(async move {
            debug!(source = %name, skip, total = readings.len(), "memory source started");
            for (idx, reading) in readings.iter().enumerate().skip(skip) {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let record = SourceRecord {
                    reading: reading.clone(),
                    position: SourcePosition(idx as u64 + 1),
                };
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            running.store(false, Ordering::SeqCst);
            debug!(source = %name, "memory source drained");
        });

        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ConnectorError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device: &str) -> SensorReading {
        SensorReading {
            template_id: "T1".into(),
            device_id: device.into(),
            sensor_value: None,
            timestamp: None,
            location: None,
            status: None,
        }
    }

    #[tokio::test]
    async fn test_memory_source_delivers_all_with_positions() {
        let mut source = MemorySource::new("mem", vec![reading("D1"), reading("D2")]);
        let (tx, mut rx) = mpsc::channel(16);
        source.start(tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.reading.device_id, "D1");
        assert_eq!(first.position, SourcePosition(1));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.position, SourcePosition(2));

        assert!(rx.recv().await.is_none(), "channel closes when drained");
    }

    #[tokio::test]
    async fn test_memory_source_seek_skips_consumed_records() {
        let readings = vec![reading("D1"), reading("D2"), reading("D3")];
        let mut source = MemorySource::new("mem", readings);
        source.seek(SourcePosition(2));

        let (tx, mut rx) = mpsc::channel(16);
        source.start(tx).await.unwrap();

        let only = rx.recv().await.unwrap();
        assert_eq!(only.reading.device_id, "D3");
        assert!(rx.recv().await.is_none());
    }
}
