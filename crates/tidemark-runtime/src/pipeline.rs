//! Pipeline assembly and job lifecycle.
//!
//! Wiring: source → pump (routing + barrier broadcast) → lanes → sink
//! writer, with the checkpoint coordinator off the hot path. All queues are
//! bounded, so a slow stage backpressures its upstream; the source stops
//! being pulled when lane queues are saturated.

use crate::aggregate::CountAggregator;
use crate::checkpoint::{CheckpointManager, StateStore, StoreError};
use crate::connector::{ConnectorError, SourceConnector, SourcePosition, SourceRecord};
use crate::coordinator::{
    BarrierRequest, CheckpointConfig, Coordinator, CoordinatorCmd, CoordinatorError,
};
use crate::lane::{Lane, LaneMsg, SinkMsg};
use crate::metrics::Metrics;
use crate::router::KeyRouter;
use crate::sink::{upsert_with_retry, RetryPolicy, SinkError, StatsSink};
use crate::window::{WindowConfig, WindowManager};
use chrono::Utc;
use std::sync::Arc;
use tidemark_core::{TimestampZone, WindowStat};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Full pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of processing lanes.
    pub parallelism: usize,
    pub window: WindowConfig,
    pub allowed_lateness: chrono::Duration,
    pub checkpoint: CheckpointConfig,
    pub retry: RetryPolicy,
    /// Capacity of the source→lane and lane→sink queues.
    pub queue_capacity: usize,
    /// Upper bound on sink write batches.
    pub sink_batch_size: usize,
    pub timestamp_zone: TimestampZone,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            window: WindowConfig {
                size: chrono::Duration::seconds(60),
                slide: chrono::Duration::seconds(30),
            },
            allowed_lateness: chrono::Duration::seconds(10),
            checkpoint: CheckpointConfig::default(),
            retry: RetryPolicy::default(),
            queue_capacity: 1024,
            sink_batch_size: 64,
            timestamp_zone: TimestampZone::Utc,
        }
    }
}

/// Fatal job errors. Recoverable conditions never surface here.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Checkpoint(#[from] CoordinatorError),
    #[error("internal: {0}")]
    Internal(String),
}

/// A running pipeline.
pub struct Job {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<Result<(), JobError>>,
}

impl Job {
    /// Restore from the latest snapshot (if any) and start the pipeline.
    pub async fn spawn(
        config: PipelineConfig,
        mut source: Box<dyn SourceConnector>,
        sink: Arc<dyn StatsSink>,
        store: Arc<dyn StateStore>,
        metrics: Metrics,
    ) -> Result<Job, JobError> {
        if config.parallelism == 0 {
            return Err(JobError::Config("parallelism must be at least 1".into()));
        }

        let manager = CheckpointManager::new(store, config.checkpoint.max_retained)?;
        let snapshot = manager.recover(config.parallelism)?;
        let resume_position = snapshot
            .as_ref()
            .map(|s| s.source_position)
            .unwrap_or_default();
        if let Some(snap) = &snapshot {
            info!(
                snapshot = snap.id,
                position = snap.source_position.0,
                "restoring from checkpoint"
            );
            source.seek(snap.source_position);
        }

        let router = KeyRouter::new(config.parallelism);
        let (sink_tx, sink_rx) = mpsc::channel::<SinkMsg>(config.queue_capacity);
        let (ack_tx, ack_rx) = mpsc::channel(config.parallelism);

        let mut lane_txs = Vec::with_capacity(config.parallelism);
        let mut lane_handles = Vec::with_capacity(config.parallelism);
        for lane_id in 0..config.parallelism {
            let (tx, rx) = mpsc::channel::<LaneMsg>(config.queue_capacity);
            let window_manager = WindowManager::new(
                config.window,
                config.allowed_lateness,
                Arc::new(CountAggregator),
            );
            let mut lane = Lane::new(
                lane_id,
                window_manager,
                sink_tx.clone(),
                ack_tx.clone(),
                metrics.clone(),
            );
            if let Some(snap) = &snapshot {
                lane.restore(&snap.lanes[lane_id]);
            }
            lane_handles.push(tokio::spawn(lane.run(rx)));
            lane_txs.push(tx);
        }
        drop(ack_tx);

        let (source_tx, source_rx) = mpsc::channel::<SourceRecord>(config.queue_capacity);
        source.start(source_tx).await?;

        let (barrier_tx, barrier_rx) = mpsc::channel::<BarrierRequest>(4);
        let pump_handle = tokio::spawn(run_pump(
            source_rx,
            barrier_rx,
            lane_txs,
            router,
            config.timestamp_zone,
            resume_position,
            metrics.clone(),
        ));

        let (error_tx, mut error_rx) = mpsc::channel::<JobError>(4);
        let sink_handle = tokio::spawn(run_sink_writer(
            sink_rx,
            sink.clone(),
            config.retry.clone(),
            config.sink_batch_size,
            metrics.clone(),
            error_tx,
        ));

        let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCmd>(1);
        let coordinator = Coordinator::new(
            config.checkpoint.clone(),
            config.parallelism,
            manager,
            barrier_tx,
            ack_rx,
            sink_tx.clone(),
            cmd_rx,
            metrics,
        );
        let mut coordinator_handle = tokio::spawn(coordinator.run());

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            // Supervise until shutdown is requested or something fatal happens.
            let fatal: Option<JobError> = tokio::select! {
                _ = shutdown_rx.recv() => None,
                err = error_rx.recv() => {
                    Some(err.unwrap_or_else(|| JobError::Internal("sink writer vanished".into())))
                }
                res = &mut coordinator_handle => Some(match res {
                    Ok(Ok(())) => JobError::Internal("coordinator stopped unexpectedly".into()),
                    Ok(Err(e)) => JobError::Checkpoint(e),
                    Err(e) => JobError::Internal(format!("coordinator task failed: {}", e)),
                }),
            };

            if let Some(err) = fatal {
                error!(error = %err, "job failed, stopping without drain");
                let _ = source.stop().await;
                pump_handle.abort();
                for h in &lane_handles {
                    h.abort();
                }
                sink_handle.abort();
                coordinator_handle.abort();
                return Err(err);
            }

            info!("shutdown requested, draining pipeline");

            // Final checkpoint while the pump is still alive. When the
            // coordinator exits, its dropped barrier sender releases the pump.
            let (done_tx, done_rx) = oneshot::channel();
            if cmd_tx
                .send(CoordinatorCmd::Shutdown { done: done_tx })
                .await
                .is_ok()
            {
                let _ = done_rx.await;
            }
            let _ = coordinator_handle.await;

            // Stop intake. Lanes drain their queues once the pump drops
            // their senders; unconsumed source records sit past the final
            // snapshot position and are re-read on the next start.
            let _ = source.stop().await;
            let _ = pump_handle.await;
            for h in lane_handles {
                let _ = h.await;
            }

            // Flush closed windows pending write before exiting.
            let (flush_tx, flush_rx) = oneshot::channel();
            if sink_tx.send(SinkMsg::Flush(flush_tx)).await.is_ok() {
                let _ = flush_rx.await;
            }
            drop(sink_tx);
            let _ = sink_handle.await;
            if let Err(e) = sink.close().await {
                warn!(error = %e, "sink close failed");
            }

            // Surface a sink failure that raced with the shutdown request.
            if let Ok(err) = error_rx.try_recv() {
                return Err(err);
            }

            info!("pipeline drained, job stopped");
            Ok(())
        });

        Ok(Job {
            shutdown_tx,
            handle,
        })
    }

    /// A sender that triggers graceful shutdown (e.g. from a signal handler).
    pub fn shutdown_trigger(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Request graceful shutdown and wait for the drain to finish.
    pub async fn shutdown(self) -> Result<(), JobError> {
        let _ = self.shutdown_tx.send(()).await;
        self.join().await
    }

    /// Wait for the job to stop on its own (fatal error or shutdown).
    pub async fn join(self) -> Result<(), JobError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(JobError::Internal(format!("job task failed: {}", e))),
        }
    }
}

/// Route readings to lanes and broadcast checkpoint barriers.
///
/// The pump is the single writer into every lane queue, so a barrier
/// broadcast is FIFO-consistent: all readings forwarded before it sit ahead
/// of it in every queue, and the position it reports covers exactly those.
async fn run_pump(
    mut source_rx: mpsc::Receiver<SourceRecord>,
    mut barrier_rx: mpsc::Receiver<BarrierRequest>,
    lane_txs: Vec<mpsc::Sender<LaneMsg>>,
    router: KeyRouter,
    zone: TimestampZone,
    mut position: SourcePosition,
    metrics: Metrics,
) {
    let mut source_open = true;
    loop {
        tokio::select! {
            req = barrier_rx.recv() => {
                let Some(BarrierRequest { epoch, position_tx }) = req else {
                    // Coordinator is gone; close the lanes by dropping their senders.
                    break;
                };
                for tx in &lane_txs {
                    let _ = tx.send(LaneMsg::Barrier { epoch }).await;
                }
                let _ = position_tx.send(position);
            }
            record = source_rx.recv(), if source_open => {
                let Some(record) = record else {
                    source_open = false;
                    continue;
                };
                position = record.position;
                metrics.readings_total.inc();

                let lane = match router.route(&record.reading) {
                    Ok(lane) => lane,
                    Err(e) => {
                        metrics.malformed_total.inc();
                        warn!(error = %e, "dropping unroutable reading");
                        continue;
                    }
                };

                let event_time = record.reading.event_time(zone, Utc::now());
                let tx = &lane_txs[lane];
                if tx
                    .send(LaneMsg::Reading { reading: record.reading, event_time })
                    .await
                    .is_err()
                {
                    warn!(lane, "lane queue closed, pump stopping");
                    break;
                }
                let depth = (tx.max_capacity() - tx.capacity()) as i64;
                metrics
                    .lane_queue_depth
                    .with_label_values(&[lane.to_string().as_str()])
                    .set(depth);
            }
        }
    }
}

/// Drain the sink queue, batching writes and retrying transient failures.
///
/// A flush message acks only after everything enqueued before it is durably
/// written. Retry exhaustion is fatal and reported to the supervisor.
async fn run_sink_writer(
    mut rx: mpsc::Receiver<SinkMsg>,
    sink: Arc<dyn StatsSink>,
    retry: RetryPolicy,
    batch_size: usize,
    metrics: Metrics,
    error_tx: mpsc::Sender<JobError>,
) {
    let mut batch: Vec<WindowStat> = Vec::with_capacity(batch_size);

    while let Some(msg) = rx.recv().await {
        let mut flush_acks: Vec<oneshot::Sender<()>> = Vec::new();
        match msg {
            SinkMsg::Write(stat) => {
                batch.push(stat);
                // Opportunistically batch whatever is already queued.
                while batch.len() < batch_size {
                    match rx.try_recv() {
                        Ok(SinkMsg::Write(stat)) => batch.push(stat),
                        Ok(SinkMsg::Flush(ack)) => {
                            flush_acks.push(ack);
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }
            SinkMsg::Flush(ack) => flush_acks.push(ack),
        }

        if !batch.is_empty() {
            match upsert_with_retry(sink.as_ref(), &batch, &retry).await {
                Ok(retries) => {
                    metrics.sink_retries_total.inc_by(retries as u64);
                    metrics.sink_upserts_total.inc_by(batch.len() as u64);
                    batch.clear();
                }
                Err(e) => {
                    error!(error = %e, "sink write failed fatally");
                    let _ = error_tx.send(JobError::Sink(e)).await;
                    // Flush acks are deliberately dropped: the writes they
                    // cover are not durable.
                    return;
                }
            }
        }

        for ack in flush_acks {
            let _ = ack.send(());
        }
    }
}
