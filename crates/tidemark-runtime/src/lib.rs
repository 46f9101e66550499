//! Tidemark Runtime - Sliding-window sensor aggregation engine
//!
//! This crate implements the processing core: watermark tracking, keyed
//! routing onto parallel lanes, sliding event-time windows, barrier-aligned
//! checkpointing, and idempotent sink delivery.

pub mod aggregate;
pub mod checkpoint;
pub mod connector;
pub mod coordinator;
pub mod lane;
pub mod metrics;
pub mod pipeline;
pub mod router;
pub mod sink;
pub mod watermark;
pub mod window;

pub use aggregate::{Aggregator, CountAggregator};
pub use checkpoint::{
    CheckpointManager, CheckpointSnapshot, FileStore, LaneCheckpoint, MemoryStore, StateStore,
    StoreError,
};
pub use connector::{
    ConnectorError, FileSource, KafkaSource, KafkaSourceConfig, MemorySource, SourceConnector,
    SourcePosition, SourceRecord, StartingOffset,
};
pub use coordinator::{CheckpointConfig, CheckpointPhase, Coordinator, CoordinatorError};
pub use metrics::{Metrics, MetricsServer};
pub use pipeline::{Job, JobError, PipelineConfig};
pub use router::{KeyRouter, RouteError};
pub use sink::{
    DatabaseConfig, DatabaseKind, DatabaseSink, MemorySink, RetryPolicy, SinkError, StatsSink,
};
pub use watermark::WatermarkTracker;
pub use window::{Assignment, WindowConfig, WindowManager};
