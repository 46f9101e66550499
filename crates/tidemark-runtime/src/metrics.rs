//! Prometheus metrics for the aggregation job.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics collection for the pipeline.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub readings_total: IntCounter,
    pub malformed_total: IntCounter,
    pub late_dropped_total: IntCounter,
    pub windows_closed_total: IntCounter,
    pub sink_upserts_total: IntCounter,
    pub sink_retries_total: IntCounter,
    pub checkpoints_total: IntCounterVec,
    pub checkpoint_duration: Histogram,
    pub lane_queue_depth: IntGaugeVec,
    pub active_windows: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let readings_total = IntCounter::new("tidemark_readings_total", "Readings ingested")
            .expect("failed to create readings_total counter");
        let malformed_total = IntCounter::new(
            "tidemark_malformed_total",
            "Readings dropped as malformed or unroutable",
        )
        .expect("failed to create malformed_total counter");
        let late_dropped_total = IntCounter::new(
            "tidemark_late_dropped_total",
            "Readings dropped for exceeding allowed lateness",
        )
        .expect("failed to create late_dropped_total counter");
        let windows_closed_total = IntCounter::new(
            "tidemark_windows_closed_total",
            "Windows closed and emitted to the sink",
        )
        .expect("failed to create windows_closed_total counter");
        let sink_upserts_total = IntCounter::new(
            "tidemark_sink_upserts_total",
            "Window results written to the sink",
        )
        .expect("failed to create sink_upserts_total counter");
        let sink_retries_total = IntCounter::new(
            "tidemark_sink_retries_total",
            "Sink write retries after transient failures",
        )
        .expect("failed to create sink_retries_total counter");

        let checkpoints_total = IntCounterVec::new(
            Opts::new("tidemark_checkpoints_total", "Checkpoint attempts by result"),
            &["result"],
        )
        .expect("failed to create checkpoints_total counter");

        let checkpoint_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tidemark_checkpoint_duration_seconds",
                "Wall time from barrier injection to commit",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )
        .expect("failed to create checkpoint_duration histogram");

        let lane_queue_depth = IntGaugeVec::new(
            Opts::new("tidemark_lane_queue_depth", "Inbound queue depth per lane"),
            &["lane"],
        )
        .expect("failed to create lane_queue_depth gauge");

        let active_windows = IntGaugeVec::new(
            Opts::new("tidemark_active_windows", "Open windows per lane"),
            &["lane"],
        )
        .expect("failed to create active_windows gauge");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(readings_total.clone()),
            Box::new(malformed_total.clone()),
            Box::new(late_dropped_total.clone()),
            Box::new(windows_closed_total.clone()),
            Box::new(sink_upserts_total.clone()),
            Box::new(sink_retries_total.clone()),
            Box::new(checkpoints_total.clone()),
            Box::new(checkpoint_duration.clone()),
            Box::new(lane_queue_depth.clone()),
            Box::new(active_windows.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("failed to register metric");
        }

        Self {
            registry: Arc::new(registry),
            readings_total,
            malformed_total,
            late_dropped_total,
            windows_closed_total,
            sink_upserts_total,
            sink_retries_total,
            checkpoints_total,
            checkpoint_duration,
            lane_queue_depth,
            active_windows,
        }
    }

    /// Record a finished checkpoint attempt.
    pub fn record_checkpoint(&self, result: &str, seconds: f64) {
        self.checkpoints_total.with_label_values(&[result]).inc();
        if result == "committed" {
            self.checkpoint_duration.observe(seconds);
        }
    }

    /// Get Prometheus text output.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server for the Prometheus scrape endpoint.
pub struct MetricsServer {
    metrics: Metrics,
    addr: String,
}

impl MetricsServer {
    pub fn new(metrics: Metrics, addr: impl Into<String>) -> Self {
        Self {
            metrics,
            addr: addr.into(),
        }
    }

    /// Run the metrics HTTP server.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (mut socket, _addr) = listener.accept().await?;

            let body = self.metrics.gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                error!("failed to write metrics response: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather_contains_counters() {
        let metrics = Metrics::new();
        metrics.readings_total.inc();
        metrics.late_dropped_total.inc();
        metrics.record_checkpoint("committed", 0.01);
        metrics.record_checkpoint("aborted", 0.0);

        let output = metrics.gather();
        assert!(output.contains("tidemark_readings_total"));
        assert!(output.contains("tidemark_late_dropped_total"));
        assert!(output.contains("tidemark_checkpoints_total"));
        assert!(output.contains("committed"));
        assert!(output.contains("aborted"));
    }

    #[test]
    fn test_metrics_lane_gauges() {
        let metrics = Metrics::new();
        metrics.lane_queue_depth.with_label_values(&["0"]).set(12);
        metrics.active_windows.with_label_values(&["1"]).set(3);

        let output = metrics.gather();
        assert!(output.contains("tidemark_lane_queue_depth"));
        assert!(output.contains("tidemark_active_windows"));
    }

    #[test]
    fn test_metrics_clone_shares_registry() {
        let first = Metrics::new();
        first.readings_total.inc();
        let second = first.clone();
        second.readings_total.inc();

        assert!(second.gather().contains("tidemark_readings_total 2"));
    }

    #[test]
    fn test_checkpoint_duration_only_observed_on_commit() {
        let metrics = Metrics::new();
        metrics.record_checkpoint("aborted", 5.0);
        let output = metrics.gather();
        assert!(output.contains("tidemark_checkpoint_duration_seconds_count 0"));
    }
}
