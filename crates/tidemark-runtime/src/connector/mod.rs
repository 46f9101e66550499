//! Source connectors for reading ingestion.

pub mod file;
pub mod kafka;
pub mod memory;
pub mod types;

pub use file::FileSource;
pub use kafka::{KafkaSource, KafkaSourceConfig, StartingOffset};
pub use memory::MemorySource;
pub use types::{ConnectorError, SourceConnector, SourcePosition, SourceRecord};
