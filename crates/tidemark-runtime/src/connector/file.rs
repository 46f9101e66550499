//! JSON-lines file source.
//!
//! One reading per line. Positions are line numbers; malformed lines are
//! logged and dropped but still advance the position, so a replay from any
//! checkpointed position sees the same remaining records.

use super::types::{ConnectorError, SourceConnector, SourcePosition, SourceRecord};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidemark_core::SensorReading;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Streams readings from a JSON-lines file.
pub struct FileSource {
    name: String,
    path: PathBuf,
    start_at: SourcePosition,
    running: Arc<AtomicBool>,
}

impl FileSource {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            start_at: SourcePosition(0),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SourceConnector for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, position: SourcePosition) {
        self.start_at = position;
    }

    async fn start(&mut self, tx: mpsc::Sender<SourceRecord>) -> Result<(), ConnectorError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(format!("{}: {}", self.path.display(), e)))?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let skip = self.start_at.0;
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            let mut position = 0u64;

            debug!(source = %name, skip, "file source started");
            while let Ok(Some(line)) = lines.next_line().await {
                position += 1;
                if position <= skip || !running.load(Ordering::SeqCst) {
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }

                match SensorReading::from_json(line.as_bytes()) {
                    Ok(reading) => {
                        let record = SourceRecord {
                            reading,
                            position: SourcePosition(position),
                        };
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(source = %name, line = position, error = %e, "dropping malformed reading");
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            debug!(source = %name, lines = position, "file source drained");
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
