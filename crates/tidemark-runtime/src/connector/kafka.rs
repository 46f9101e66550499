//! Kafka source for sensor readings.
//!
//! A stub implementation is always available so configuration can be
//! validated without the heavy dependency; the full implementation requires
//! the `kafka` feature (rdkafka).

use super::types::{ConnectorError, SourceConnector, SourcePosition, SourceRecord};
use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::warn;

/// Where consumption begins when no checkpointed position is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartingOffset {
    #[default]
    Latest,
    Earliest,
}

impl StartingOffset {
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            StartingOffset::Latest => "latest",
            StartingOffset::Earliest => "earliest",
        }
    }
}

impl std::str::FromStr for StartingOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" => Ok(StartingOffset::Latest),
            "earliest" => Ok(StartingOffset::Earliest),
            other => Err(format!("unsupported starting offset: {}", other)),
        }
    }
}

/// Kafka source configuration.
#[derive(Debug, Clone)]
pub struct KafkaSourceConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: Option<String>,
    pub starting_offset: StartingOffset,
    /// Extra consumer properties passed straight through to librdkafka.
    pub properties: IndexMap<String, String>,
}

impl KafkaSourceConfig {
    pub fn new(brokers: &str, topic: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            group_id: None,
            starting_offset: StartingOffset::default(),
            properties: IndexMap::new(),
        }
    }

    pub fn with_group_id(mut self, group_id: &str) -> Self {
        self.group_id = Some(group_id.to_string());
        self
    }

    pub fn with_starting_offset(mut self, offset: StartingOffset) -> Self {
        self.starting_offset = offset;
        self
    }
}

/// Kafka source connector (stub without the `kafka` feature).
#[cfg(not(feature = "kafka"))]
pub struct KafkaSource {
    name: String,
    #[allow(dead_code)]
    config: KafkaSourceConfig,
}

#[cfg(not(feature = "kafka"))]
impl KafkaSource {
    pub fn new(name: &str, config: KafkaSourceConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[cfg(not(feature = "kafka"))]
#[async_trait]
impl SourceConnector for KafkaSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn seek(&mut self, _position: SourcePosition) {}

    async fn start(&mut self, _tx: mpsc::Sender<SourceRecord>) -> Result<(), ConnectorError> {
        warn!(source = %self.name, "kafka source built without the 'kafka' feature");
        Err(ConnectorError::NotAvailable(
            "kafka source requires the 'kafka' feature".to_string(),
        ))
    }

    async fn stop(&mut self) -> Result<(), ConnectorError> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }
}

#[cfg(feature = "kafka")]
mod kafka_impl {
    use super::*;
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
    use rdkafka::{Message, Offset, TopicPartitionList};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tidemark_core::SensorReading;
    use tracing::{error, info};

    /// Kafka source with rdkafka.
    ///
    /// The opaque `SourcePosition` maps onto a single-partition offset; the
    /// source assigns partition 0 explicitly so checkpointed positions are
    /// meaningful across restarts.
    pub struct KafkaSource {
        name: String,
        config: KafkaSourceConfig,
        resume_from: Option<SourcePosition>,
        running: Arc<AtomicBool>,
    }

    impl KafkaSource {
        pub fn new(name: &str, config: KafkaSourceConfig) -> Self {
            Self {
                name: name.to_string(),
                config,
                resume_from: None,
                running: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl SourceConnector for KafkaSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn seek(&mut self, position: SourcePosition) {
            self.resume_from = Some(position);
        }

        async fn start(&mut self, tx: mpsc::Sender<SourceRecord>) -> Result<(), ConnectorError> {
            // Stable group id so offsets survive restarts even without a
            // checkpointed position.
            let group_id = self
                .config
                .group_id
                .clone()
                .unwrap_or_else(|| format!("tidemark-{}", self.name));

            let mut client_config = ClientConfig::new();
            client_config
                .set("bootstrap.servers", &self.config.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set(
                    "auto.offset.reset",
                    self.config.starting_offset.as_kafka_value(),
                );
            for (k, v) in &self.config.properties {
                match k.as_str() {
                    "bootstrap.servers" | "group.id" => continue,
                    _ => {
                        client_config.set(k, v);
                    }
                }
            }

            let consumer: StreamConsumer = client_config
                .create()
                .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

            match self.resume_from {
                Some(position) => {
                    // Explicit resume: assign partition 0 at the checkpointed offset.
                    let mut assignment = TopicPartitionList::new();
                    assignment
                        .add_partition_offset(
                            &self.config.topic,
                            0,
                            Offset::Offset(position.0 as i64),
                        )
                        .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;
                    consumer
                        .assign(&assignment)
                        .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
                }
                None => {
                    consumer
                        .subscribe(&[&self.config.topic])
                        .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
                }
            }

            self.running.store(true, Ordering::SeqCst);
            let running = self.running.clone();
            let name = self.name.clone();

            tokio::spawn(async move {
                info!(source = %name, "kafka source started");

                use futures::StreamExt;
                let mut stream = consumer.stream();
                let mut consecutive_errors: u32 = 0;

                while running.load(Ordering::SeqCst) {
                    match tokio::time::timeout(Duration::from_millis(100), stream.next()).await {
                        Ok(Some(Ok(msg))) => {
                            consecutive_errors = 0;

                            if let Some(payload) = msg.payload() {
                                match SensorReading::from_json(payload) {
                                    Ok(reading) => {
                                        let record = SourceRecord {
                                            reading,
                                            position: SourcePosition(msg.offset() as u64 + 1),
                                        };
                                        if tx.send(record).await.is_err() {
                                            warn!(source = %name, "channel closed");
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(source = %name, error = %e, "dropping malformed reading");
                                    }
                                }
                            }

                            if let Err(e) = consumer.commit_message(&msg, CommitMode::Async) {
                                warn!(source = %name, error = %e, "offset commit failed");
                            }
                        }
                        Ok(Some(Err(e))) => {
                            consecutive_errors += 1;
                            let backoff =
                                Duration::from_millis(100 * 2u64.pow(consecutive_errors.min(7)));
                            error!(source = %name, backoff_ms = backoff.as_millis() as u64, error = %e, "consumer error");
                            tokio::time::sleep(backoff).await;
                        }
                        Ok(None) => break,
                        Err(_) => {} // poll timeout, loop to re-check running
                    }
                }

                info!(source = %name, "kafka source stopped");
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
}

#[cfg(feature = "kafka")]
pub use kafka_impl::KafkaSource;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starting_offset_parse() {
        assert_eq!("latest".parse::<StartingOffset>(), Ok(StartingOffset::Latest));
        assert_eq!(
            "EARLIEST".parse::<StartingOffset>(),
            Ok(StartingOffset::Earliest)
        );
        assert!("yesterday".parse::<StartingOffset>().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = KafkaSourceConfig::new("localhost:9092", "sensor-data")
            .with_group_id("tidemark-job")
            .with_starting_offset(StartingOffset::Earliest);
        assert_eq!(config.brokers, "localhost:9092");
        assert_eq!(config.group_id.as_deref(), Some("tidemark-job"));
        assert_eq!(config.starting_offset.as_kafka_value(), "earliest");
    }
}
