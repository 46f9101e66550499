//! Barrier-aligned checkpoint coordination.
//!
//! On a fixed interval the coordinator injects a barrier through the source
//! pump (so it lands in every lane queue FIFO-ordered with events), collects
//! each lane's state acknowledgment, waits for the sink queue to drain, and
//! commits the union as one snapshot. An attempt that overruns its timeout
//! is aborted and retried on the next interval; too many consecutive aborts
//! stop the job rather than let it run without a recovery point.

use crate::checkpoint::{
    CheckpointManager, CheckpointSnapshot, LaneCheckpoint, StoreError, SNAPSHOT_VERSION,
};
use crate::connector::SourcePosition;
use crate::lane::{BarrierAck, SinkMsg};
use crate::metrics::Metrics;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Checkpointing configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Interval between checkpoint attempts.
    pub interval: Duration,
    /// Budget for a single attempt, barrier to commit.
    pub timeout: Duration,
    /// Consecutive aborted attempts tolerated before the job is failed.
    pub tolerable_failures: u32,
    /// Snapshots retained in the store.
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            tolerable_failures: 3,
            max_retained: 3,
        }
    }
}

/// Lifecycle of one checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    Pending,
    BarrierInjected,
    Aligning,
    Snapshotting,
    Committed,
    Aborted,
}

/// Request for the source pump to broadcast a barrier.
///
/// The pump replies with the source position recorded at the instant of the
/// broadcast; every reading enqueued before the barrier has a position at or
/// below it.
pub struct BarrierRequest {
    pub epoch: u64,
    pub position_tx: oneshot::Sender<SourcePosition>,
}

/// Control commands for the coordinator.
pub enum CoordinatorCmd {
    /// Take a final checkpoint, then stop.
    Shutdown { done: oneshot::Sender<()> },
}

/// Fatal coordination errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("checkpointing failed {failures} consecutive times, last: {last}")]
    TooManyFailures { failures: u32, last: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Coordinator {
    config: CheckpointConfig,
    lane_count: usize,
    manager: CheckpointManager,
    barrier_tx: mpsc::Sender<BarrierRequest>,
    ack_rx: mpsc::Receiver<BarrierAck>,
    sink_tx: mpsc::Sender<SinkMsg>,
    cmd_rx: mpsc::Receiver<CoordinatorCmd>,
    metrics: Metrics,
    epoch: u64,
    consecutive_failures: u32,
    phase: CheckpointPhase,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CheckpointConfig,
        lane_count: usize,
        manager: CheckpointManager,
        barrier_tx: mpsc::Sender<BarrierRequest>,
        ack_rx: mpsc::Receiver<BarrierAck>,
        sink_tx: mpsc::Sender<SinkMsg>,
        cmd_rx: mpsc::Receiver<CoordinatorCmd>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            lane_count,
            manager,
            barrier_tx,
            ack_rx,
            sink_tx,
            cmd_rx,
            metrics,
            epoch: 0,
            consecutive_failures: 0,
            phase: CheckpointPhase::Pending,
        }
    }

    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    /// Drive periodic checkpoints until shutdown or a fatal failure.
    pub async fn run(mut self) -> Result<(), CoordinatorError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.periodic_attempt().await?;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(CoordinatorCmd::Shutdown { done }) => {
                            // Best-effort final snapshot; a failure here only
                            // costs replay depth on the next start.
                            if let Err(e) = self.attempt().await {
                                warn!(error = %e, "final checkpoint failed");
                            }
                            let _ = done.send(());
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn periodic_attempt(&mut self) -> Result<(), CoordinatorError> {
        match self.attempt().await {
            Ok(_) => {
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(last) => {
                self.consecutive_failures += 1;
                warn!(
                    failures = self.consecutive_failures,
                    tolerable = self.config.tolerable_failures,
                    error = %last,
                    "checkpoint attempt aborted"
                );
                if self.consecutive_failures > self.config.tolerable_failures {
                    return Err(CoordinatorError::TooManyFailures {
                        failures: self.consecutive_failures,
                        last,
                    });
                }
                Ok(())
            }
        }
    }

    /// Run one attempt under the configured timeout.
    ///
    /// Phase returns to `Pending` when the next attempt begins; in between,
    /// the terminal `Committed`/`Aborted` state of the last attempt is
    /// observable through [`phase`](Self::phase).
    async fn attempt(&mut self) -> Result<u64, String> {
        self.epoch += 1;
        self.phase = CheckpointPhase::Pending;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.config.timeout, Self::run_barrier_protocol(
            self.epoch,
            self.lane_count,
            &self.barrier_tx,
            &mut self.ack_rx,
            &self.sink_tx,
            &mut self.phase,
        ))
        .await
        {
            Ok(Ok(lanes_and_position)) => Ok(lanes_and_position),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(format!(
                "epoch {} exceeded checkpoint timeout ({:?})",
                self.epoch, self.config.timeout
            )),
        };

        let result = match outcome {
            Ok((position, lanes)) => {
                let snapshot = CheckpointSnapshot {
                    id: 0, // assigned by the manager
                    version: SNAPSHOT_VERSION,
                    timestamp_ms: 0,
                    lane_count: self.lane_count,
                    source_position: position,
                    lanes,
                };
                self.manager.commit(snapshot).map_err(|e| e.to_string())
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(id) => {
                self.phase = CheckpointPhase::Committed;
                self.metrics
                    .record_checkpoint("committed", started.elapsed().as_secs_f64());
                debug!(epoch = self.epoch, snapshot = id, "checkpoint committed");
                Ok(id)
            }
            Err(e) => {
                self.phase = CheckpointPhase::Aborted;
                self.metrics.record_checkpoint("aborted", 0.0);
                Err(e)
            }
        }
    }

    /// Barrier injection, alignment, and sink drain for one epoch.
    async fn run_barrier_protocol(
        epoch: u64,
        lane_count: usize,
        barrier_tx: &mpsc::Sender<BarrierRequest>,
        ack_rx: &mut mpsc::Receiver<BarrierAck>,
        sink_tx: &mpsc::Sender<SinkMsg>,
        phase: &mut CheckpointPhase,
    ) -> Result<(SourcePosition, Vec<LaneCheckpoint>), String> {
        *phase = CheckpointPhase::BarrierInjected;
        let (position_tx, position_rx) = oneshot::channel();
        barrier_tx
            .send(BarrierRequest { epoch, position_tx })
            .await
            .map_err(|_| "source pump is gone".to_string())?;
        let position = position_rx
            .await
            .map_err(|_| "source pump dropped the barrier".to_string())?;

        *phase = CheckpointPhase::Aligning;
        let mut lanes: Vec<Option<LaneCheckpoint>> = vec![None; lane_count];
        let mut pending = lane_count;
        while pending > 0 {
            let ack = ack_rx
                .recv()
                .await
                .ok_or_else(|| "lane ack channel closed".to_string())?;
            if ack.epoch != epoch {
                // Stale ack from an aborted attempt
                continue;
            }
            if ack.lane < lane_count && lanes[ack.lane].replace(ack.state).is_none() {
                pending -= 1;
            }
        }

        *phase = CheckpointPhase::Snapshotting;
        // Outstanding sink writes for pre-barrier windows must be durable
        // before the snapshot counts as complete.
        let (flush_tx, flush_rx) = oneshot::channel();
        sink_tx
            .send(SinkMsg::Flush(flush_tx))
            .await
            .map_err(|_| "sink writer is gone".to_string())?;
        flush_rx
            .await
            .map_err(|_| "sink writer dropped the flush".to_string())?;

        let lanes: Vec<LaneCheckpoint> = lanes.into_iter().flatten().collect();
        if lanes.len() != lane_count {
            return Err("barrier alignment lost a lane".to_string());
        }
        Ok((position, lanes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MemoryStore, StateStore, WatermarkCheckpoint};
    use std::sync::Arc;

    fn lane_state(late_dropped: u64) -> LaneCheckpoint {
        LaneCheckpoint {
            windows: Vec::new(),
            watermark: WatermarkCheckpoint {
                max_seen_ms: Some(1000),
                watermark_ms: Some(900),
            },
            late_dropped,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        cmd_tx: mpsc::Sender<CoordinatorCmd>,
        handle: tokio::task::JoinHandle<Result<(), CoordinatorError>>,
        pump: tokio::task::JoinHandle<()>,
        sink: tokio::task::JoinHandle<()>,
    }

    /// Stand up a coordinator against an emulated pump, two lanes, and a
    /// sink writer that acks flushes immediately.
    fn harness(config: CheckpointConfig, responsive: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let manager = CheckpointManager::new(store.clone(), config.max_retained).unwrap();

        let (barrier_tx, mut barrier_rx) = mpsc::channel::<BarrierRequest>(4);
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let (sink_tx, mut sink_rx) = mpsc::channel::<SinkMsg>(4);
        let (cmd_tx, cmd_rx) = mpsc::channel(1);

        let pump = tokio::spawn(async move {
            while let Some(req) = barrier_rx.recv().await {
                if !responsive {
                    continue; // swallow the barrier: alignment never completes
                }
                let _ = req.position_tx.send(SourcePosition(42));
                for lane in 0..2 {
                    let _ = ack_tx
                        .send(BarrierAck {
                            epoch: req.epoch,
                            lane,
                            state: lane_state(lane as u64),
                        })
                        .await;
                }
            }
        });

        let sink = tokio::spawn(async move {
            while let Some(msg) = sink_rx.recv().await {
                if let SinkMsg::Flush(ack) = msg {
                    let _ = ack.send(());
                }
            }
        });

        let coordinator = Coordinator::new(
            config,
            2,
            manager,
            barrier_tx,
            ack_rx,
            sink_tx,
            cmd_rx,
            Metrics::new(),
        );
        let handle = tokio::spawn(coordinator.run());

        Harness {
            store,
            cmd_tx,
            handle,
            pump,
            sink,
        }
    }

    #[tokio::test]
    async fn test_new_coordinator_starts_pending() {
        let store = Arc::new(MemoryStore::new());
        let manager = CheckpointManager::new(store.clone(), 3).unwrap();
        let (barrier_tx, _barrier_rx) = mpsc::channel(1);
        let (_ack_tx, ack_rx) = mpsc::channel(1);
        let (sink_tx, _sink_rx) = mpsc::channel(1);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);

        let coordinator = Coordinator::new(
            CheckpointConfig::default(),
            1,
            manager,
            barrier_tx,
            ack_rx,
            sink_tx,
            cmd_rx,
            Metrics::new(),
        );
        assert_eq!(coordinator.phase(), CheckpointPhase::Pending);
    }

    #[tokio::test]
    async fn test_periodic_checkpoint_commits() {
        let h = harness(
            CheckpointConfig {
                interval: Duration::from_millis(20),
                timeout: Duration::from_millis(500),
                tolerable_failures: 3,
                max_retained: 3,
            },
            true,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;

        let ids = h.store.list_snapshots().unwrap();
        assert!(!ids.is_empty(), "no snapshot committed");

        let snapshot = h.store.load_latest().unwrap().unwrap();
        assert_eq!(snapshot.lane_count, 2);
        assert_eq!(snapshot.source_position, SourcePosition(42));
        assert_eq!(snapshot.lanes[1].late_dropped, 1);

        let (done_tx, done_rx) = oneshot::channel();
        h.cmd_tx
            .send(CoordinatorCmd::Shutdown { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();
        h.handle.await.unwrap().unwrap();
        h.pump.abort();
        h.sink.abort();
    }

    #[tokio::test]
    async fn test_shutdown_takes_final_checkpoint() {
        let h = harness(
            CheckpointConfig {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_millis(500),
                tolerable_failures: 3,
                max_retained: 3,
            },
            true,
        );

        let (done_tx, done_rx) = oneshot::channel();
        h.cmd_tx
            .send(CoordinatorCmd::Shutdown { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();
        h.handle.await.unwrap().unwrap();

        assert_eq!(
            h.store.list_snapshots().unwrap().len(),
            1,
            "shutdown must commit a final snapshot"
        );
        h.pump.abort();
        h.sink.abort();
    }

    #[tokio::test]
    async fn test_repeated_failures_are_fatal() {
        let h = harness(
            CheckpointConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_millis(10),
                tolerable_failures: 1,
                max_retained: 3,
            },
            false, // pump never answers: every attempt times out
        );

        let err = h.handle.await.unwrap().unwrap_err();
        match err {
            CoordinatorError::TooManyFailures { failures, .. } => {
                assert_eq!(failures, 2, "fails on the first attempt past the budget");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(h.store.list_snapshots().unwrap().is_empty());
        h.pump.abort();
        h.sink.abort();
    }

    #[tokio::test]
    async fn test_retention_pruned_across_attempts() {
        let h = harness(
            CheckpointConfig {
                interval: Duration::from_millis(10),
                timeout: Duration::from_millis(500),
                tolerable_failures: 3,
                max_retained: 2,
            },
            true,
        );

        tokio::time::sleep(Duration::from_millis(120)).await;

        let ids = h.store.list_snapshots().unwrap();
        assert!(ids.len() <= 2, "retention not enforced: {:?}", ids);
        assert!(ids.len() >= 2, "expected several commits by now");

        let (done_tx, done_rx) = oneshot::channel();
        h.cmd_tx
            .send(CoordinatorCmd::Shutdown { done: done_tx })
            .await
            .unwrap();
        done_rx.await.unwrap();
        h.handle.await.unwrap().unwrap();
        h.pump.abort();
        h.sink.abort();
    }
}
