//! Per-lane processing task.
//!
//! A lane is the single mutator of its window state: it pulls messages off
//! its bounded inbound queue strictly in order, so per-key event order is
//! preserved and barrier alignment falls out of queue FIFO ordering.
//! Everything enqueued before a barrier is processed before the lane
//! acknowledges it.

use crate::checkpoint::LaneCheckpoint;
use crate::metrics::Metrics;
use crate::window::{Assignment, WindowManager};
use chrono::{DateTime, Utc};
use tidemark_core::{SensorReading, WindowStat};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Messages delivered to a lane through its inbound queue.
pub enum LaneMsg {
    Reading {
        reading: SensorReading,
        event_time: DateTime<Utc>,
    },
    /// Checkpoint barrier: snapshot state and acknowledge.
    Barrier { epoch: u64 },
}

/// A lane's acknowledgment of a checkpoint barrier, carrying its state.
pub struct BarrierAck {
    pub epoch: u64,
    pub lane: usize,
    pub state: LaneCheckpoint,
}

/// Messages delivered to the sink writer.
pub enum SinkMsg {
    Write(WindowStat),
    /// Ack once everything enqueued before this message is durably written.
    Flush(oneshot::Sender<()>),
}

/// One processing lane.
pub struct Lane {
    id: usize,
    manager: WindowManager,
    sink_tx: mpsc::Sender<SinkMsg>,
    ack_tx: mpsc::Sender<BarrierAck>,
    metrics: Metrics,
}

impl Lane {
    pub fn new(
        id: usize,
        manager: WindowManager,
        sink_tx: mpsc::Sender<SinkMsg>,
        ack_tx: mpsc::Sender<BarrierAck>,
        metrics: Metrics,
    ) -> Self {
        Self {
            id,
            manager,
            sink_tx,
            ack_tx,
            metrics,
        }
    }

    /// Rehydrate this lane's state from a snapshot before it starts.
    pub fn restore(&mut self, cp: &LaneCheckpoint) {
        self.manager.restore(cp);
    }

    /// Process messages until the inbound queue closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LaneMsg>) {
        let lane_label = self.id.to_string();
        debug!(lane = self.id, "lane started");

        while let Some(msg) = rx.recv().await {
            match msg {
                LaneMsg::Reading {
                    reading,
                    event_time,
                } => {
                    if self.manager.on_event(&reading, event_time) == Assignment::Late {
                        self.metrics.late_dropped_total.inc();
                    }

                    for stat in self.manager.on_watermark_advance() {
                        self.metrics.windows_closed_total.inc();
                        if self.sink_tx.send(SinkMsg::Write(stat)).await.is_err() {
                            warn!(lane = self.id, "sink queue closed, stopping lane");
                            return;
                        }
                    }

                    self.metrics
                        .active_windows
                        .with_label_values(&[lane_label.as_str()])
                        .set(self.manager.active_windows() as i64);
                }
                LaneMsg::Barrier { epoch } => {
                    let ack = BarrierAck {
                        epoch,
                        lane: self.id,
                        state: self.manager.checkpoint(),
                    };
                    if self.ack_tx.send(ack).await.is_err() {
                        debug!(lane = self.id, "coordinator gone, dropping barrier ack");
                    }
                }
            }
        }

        debug!(
            lane = self.id,
            late_dropped = self.manager.late_dropped(),
            "lane drained"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::CountAggregator;
    use crate::window::WindowConfig;
    use chrono::Duration;
    use std::sync::Arc;

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

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(secs * 1000).unwrap()
    }

    fn manager() -> WindowManager {
        WindowManager::new(
            WindowConfig {
                size: Duration::seconds(60),
                slide: Duration::seconds(60),
            },
            Duration::seconds(0),
            Arc::new(CountAggregator),
        )
    }

    #[tokio::test]
    async fn test_lane_emits_closed_windows_to_sink() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (ack_tx, _ack_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        let lane = Lane::new(0, manager(), sink_tx, ack_tx, Metrics::new());
        let handle = tokio::spawn(lane.run(rx));

        for secs in [10, 20, 200] {
            tx.send(LaneMsg::Reading {
                reading: reading("D1"),
                event_time: ts(secs),
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let msg = sink_rx.recv().await.unwrap();
        match msg {
            SinkMsg::Write(stat) => {
                assert_eq!(stat.count, 2);
                assert_eq!(stat.window_start.timestamp(), 0);
            }
            SinkMsg::Flush(_) => panic!("unexpected flush"),
        }
    }

    #[tokio::test]
    async fn test_lane_acks_barrier_with_state() {
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let (ack_tx, mut ack_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        let lane = Lane::new(3, manager(), sink_tx, ack_tx, Metrics::new());
        let handle = tokio::spawn(lane.run(rx));

        tx.send(LaneMsg::Reading {
            reading: reading("D1"),
            event_time: ts(10),
        })
        .await
        .unwrap();
        tx.send(LaneMsg::Barrier { epoch: 7 }).await.unwrap();

        let ack = ack_rx.recv().await.unwrap();
        assert_eq!(ack.epoch, 7);
        assert_eq!(ack.lane, 3);
        assert_eq!(ack.state.windows.len(), 1);
        assert_eq!(ack.state.windows[0].count, 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_barrier_alignment_includes_prior_events_only() {
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let (ack_tx, mut ack_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        let lane = Lane::new(0, manager(), sink_tx, ack_tx, Metrics::new());
        let handle = tokio::spawn(lane.run(rx));

        // Two events, then a barrier, then one more event
        for secs in [10, 20] {
            tx.send(LaneMsg::Reading {
                reading: reading("D1"),
                event_time: ts(secs),
            })
            .await
            .unwrap();
        }
        tx.send(LaneMsg::Barrier { epoch: 1 }).await.unwrap();
        tx.send(LaneMsg::Reading {
            reading: reading("D1"),
            event_time: ts(30),
        })
        .await
        .unwrap();

        let ack = ack_rx.recv().await.unwrap();
        assert_eq!(
            ack.state.windows[0].count, 2,
            "post-barrier event must not be in the snapshot"
        );

        drop(tx);
        handle.await.unwrap();
    }
}
