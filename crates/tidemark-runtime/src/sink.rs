//! Sinks for closed-window results.
//!
//! A sink write is an idempotent replace-on-conflict keyed by
//! `(template_id, device_id, window_start, window_end)`: applying the same
//! result twice leaves the stored row identical except for its write
//! timestamp. Recovery replay therefore never double-counts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tidemark_core::WindowStat;
use tracing::warn;

/// Error raised by sink operations.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Temporary condition (timeout, connection loss); worth retrying.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// The write can never succeed as-is.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
    /// Retry budget exhausted; the job must stop rather than drop the result.
    #[error("sink retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Destination for closed-window results.
#[async_trait]
pub trait StatsSink: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent upsert of one result row.
    async fn upsert(&self, stat: &WindowStat) -> Result<(), SinkError>;

    /// Upsert a batch. Each member independently satisfies the idempotent
    /// key contract; the default implementation writes them one by one.
    async fn upsert_batch(&self, stats: &[WindowStat]) -> Result<(), SinkError> {
        for stat in stats {
            self.upsert(stat).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Bounded exponential backoff for transient sink failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max_delay)
    }
}

/// Write a batch through a sink, retrying transient failures.
///
/// Returns the number of retries spent. Exhausting the retry budget
/// surfaces `SinkError::Exhausted`; the caller must treat that as fatal
/// since a closed window's result is never silently dropped.
pub async fn upsert_with_retry(
    sink: &dyn StatsSink,
    stats: &[WindowStat],
    policy: &RetryPolicy,
) -> Result<u32, SinkError> {
    let mut attempt = 0u32;
    loop {
        match sink.upsert_batch(stats).await {
            Ok(()) => return Ok(attempt),
            Err(SinkError::Transient(msg)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(SinkError::Exhausted {
                        attempts: attempt,
                        last: msg,
                    });
                }
                let delay = policy.delay(attempt - 1);
                warn!(
                    sink = sink.name(),
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %msg,
                    "sink write failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}

/// A row as stored by the in-memory sink.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStat {
    pub count: u64,
    pub write_time: DateTime<Utc>,
}

/// In-memory sink keyed by the idempotency columns.
///
/// Used by tests and as the default when no database is configured. Counts
/// every applied upsert so replay is observable even when the stored row
/// does not change.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<HashMap<(String, String, i64, i64), StoredStat>>,
    upserts_total: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the stored row for a window instance.
    pub fn get(&self, stat: &WindowStat) -> Option<StoredStat> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let (t, d, s, e) = stat.conflict_key();
        rows.get(&(t.to_string(), d.to_string(), s, e)).cloned()
    }

    /// Number of distinct window rows stored.
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total upserts applied, including replays of the same row.
    pub fn upserts(&self) -> u64 {
        self.upserts_total.load(Ordering::Relaxed)
    }

    /// All stored rows as `(template_id, device_id, start_ms, end_ms, count)`.
    pub fn rows(&self) -> Vec<(String, String, i64, i64, u64)> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = rows
            .iter()
            .map(|((t, d, s, e), row)| (t.clone(), d.clone(), *s, *e, row.count))
            .collect();
        out.sort();
        out
    }
}

#[async_trait]
impl StatsSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, stat: &WindowStat) -> Result<(), SinkError> {
        let (t, d, s, e) = stat.conflict_key();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.insert(
            (t.to_string(), d.to_string(), s, e),
            StoredStat {
                count: stat.count,
                write_time: Utc::now(),
            },
        );
        self.upserts_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// =============================================================================
// Database sink (sqlx, feature "database")
// =============================================================================

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    MySql,
    PostgreSql,
}

impl std::str::FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseKind::MySql),
            "postgresql" | "postgres" => Ok(DatabaseKind::PostgreSql),
            other => Err(format!("unsupported database type: {}", other)),
        }
    }
}

/// Database sink configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(kind: DatabaseKind, url: &str) -> Self {
        Self {
            kind,
            url: url.to_string(),
            max_connections: 5,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

#[cfg(feature = "database")]
mod database_impl {
    use super::*;
    use sqlx::pool::PoolOptions;
    use sqlx::AnyPool;
    use tracing::{debug, info};

    const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    fn ddl(kind: DatabaseKind) -> Vec<&'static str> {
        match kind {
            DatabaseKind::MySql => vec![
                "CREATE TABLE IF NOT EXISTS sensor_statistics (\
                 id BIGINT AUTO_INCREMENT PRIMARY KEY,\
                 template_id VARCHAR(50) NOT NULL,\
                 device_id VARCHAR(50) NOT NULL,\
                 data_count BIGINT NOT NULL DEFAULT 0,\
                 window_start DATETIME NOT NULL,\
                 window_end DATETIME NOT NULL,\
                 created_time DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,\
                 updated_time DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,\
                 UNIQUE KEY uk_template_device_window (template_id, device_id, window_start, window_end),\
                 INDEX idx_template_device (template_id, device_id),\
                 INDEX idx_window_time (window_start, window_end)\
                 ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            ],
            DatabaseKind::PostgreSql => vec![
                "CREATE TABLE IF NOT EXISTS sensor_statistics (\
                 id BIGSERIAL PRIMARY KEY,\
                 template_id VARCHAR(50) NOT NULL,\
                 device_id VARCHAR(50) NOT NULL,\
                 data_count BIGINT NOT NULL DEFAULT 0,\
                 window_start TIMESTAMP NOT NULL,\
                 window_end TIMESTAMP NOT NULL,\
                 created_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,\
                 updated_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,\
                 CONSTRAINT uk_template_device_window UNIQUE (template_id, device_id, window_start, window_end)\
                 )",
                "CREATE INDEX IF NOT EXISTS idx_template_device ON sensor_statistics (template_id, device_id)",
                "CREATE INDEX IF NOT EXISTS idx_window_time ON sensor_statistics (window_start, window_end)",
            ],
        }
    }

    fn upsert_sql(kind: DatabaseKind) -> &'static str {
        match kind {
            DatabaseKind::MySql => {
                "INSERT INTO sensor_statistics \
                 (template_id, device_id, data_count, window_start, window_end, created_time, updated_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE \
                 data_count = VALUES(data_count), updated_time = VALUES(updated_time)"
            }
            DatabaseKind::PostgreSql => {
                "INSERT INTO sensor_statistics \
                 (template_id, device_id, data_count, window_start, window_end, created_time, updated_time) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (template_id, device_id, window_start, window_end) \
                 DO UPDATE SET \
                 data_count = EXCLUDED.data_count, updated_time = EXCLUDED.updated_time"
            }
        }
    }

    /// Whether a sqlx error is worth retrying.
    fn classify(e: sqlx::Error) -> SinkError {
        match e {
            sqlx::Error::Io(e) => SinkError::Transient(e.to_string()),
            sqlx::Error::PoolTimedOut => SinkError::Transient("pool timed out".to_string()),
            sqlx::Error::PoolClosed => SinkError::Transient("pool closed".to_string()),
            other => SinkError::Permanent(other.to_string()),
        }
    }

    /// Database sink with replace-on-conflict semantics.
    pub struct DatabaseSink {
        config: DatabaseConfig,
        pool: AnyPool,
    }

    impl DatabaseSink {
        /// Connect, then ensure the statistics table and its uniqueness
        /// constraint exist.
        pub async fn connect(config: DatabaseConfig) -> Result<Self, SinkError> {
            sqlx::any::install_default_drivers();
            let pool = PoolOptions::<sqlx::Any>::new()
                .max_connections(config.max_connections)
                .connect(&config.url)
                .await
                .map_err(classify)?;

            for statement in ddl(config.kind) {
                sqlx::query(statement)
                    .execute(&pool)
                    .await
                    .map_err(classify)?;
            }

            info!(kind = ?config.kind, "database sink connected, schema ready");
            Ok(Self { config, pool })
        }
    }

    #[async_trait]
    impl StatsSink for DatabaseSink {
        fn name(&self) -> &str {
            "database"
        }

        async fn upsert(&self, stat: &WindowStat) -> Result<(), SinkError> {
            let now = Utc::now().format(TIME_FORMAT).to_string();
            let result = sqlx::query(upsert_sql(self.config.kind))
                .bind(&stat.template_id)
                .bind(&stat.device_id)
                .bind(stat.count as i64)
                .bind(stat.window_start.format(TIME_FORMAT).to_string())
                .bind(stat.window_end.format(TIME_FORMAT).to_string())
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await
                .map_err(classify)?;

            debug!(rows = result.rows_affected(), stat = %stat, "upserted window stat");
            Ok(())
        }

        async fn close(&self) -> Result<(), SinkError> {
            self.pool.close().await;
            Ok(())
        }
    }
}

#[cfg(feature = "database")]
pub use database_impl::DatabaseSink;

/// Stub when built without the `database` feature.
#[cfg(not(feature = "database"))]
pub struct DatabaseSink;

#[cfg(not(feature = "database"))]
impl DatabaseSink {
    pub async fn connect(_config: DatabaseConfig) -> Result<Self, SinkError> {
        Err(SinkError::Permanent(
            "database sink requires the 'database' feature".to_string(),
        ))
    }
}

#[cfg(not(feature = "database"))]
#[async_trait]
impl StatsSink for DatabaseSink {
    fn name(&self) -> &str {
        "database"
    }

    async fn upsert(&self, _stat: &WindowStat) -> Result<(), SinkError> {
        Err(SinkError::Permanent(
            "database sink requires the 'database' feature".to_string(),
        ))
    }
}
