//! Operator replay
//!
//! Reads the durable JSONL log from a checkpoint and pushes every event
//! back through the materializer. Idempotency via mutation ids makes the
//! whole operation safe to repeat.

use crate::gml::{MaterializeResult, Materializer};
use events::{EventLog, LogPosition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Summary of one replay pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Events read from the log
    pub events_read: u64,
    /// Mutations applied
    pub applied: u64,
    /// Dedupe hits (already materialized)
    pub dedup_hit: u64,
    /// Events without a map entry
    pub unhandled: u64,
    /// Mutations skipped because the graph was unavailable
    pub skipped: u64,
    /// Checkpoint to resume from next time
    pub position: LogPosition,
}

/// Replays the event log through the materializer
pub struct Replayer {
    log: Arc<EventLog>,
    materializer: Arc<Materializer>,
}

impl Replayer {
    /// Create a replayer.
    pub fn new(log: Arc<EventLog>, materializer: Arc<Materializer>) -> Self {
        Self { log, materializer }
    }

    /// Replay everything after `position`.
    pub async fn replay_from(&self, position: &LogPosition) -> events::Result<ReplayReport> {
        let (batch, new_position) = self.log.read_from(position)?;

        let mut report = ReplayReport {
            position: new_position,
            ..Default::default()
        };

        for event in batch {
            report.events_read += 1;
            match self.materializer.process(&event).await {
                MaterializeResult::Applied => report.applied += 1,
                MaterializeResult::DedupHit => report.dedup_hit += 1,
                MaterializeResult::Unhandled => report.unhandled += 1,
                MaterializeResult::SkippedLegacy | MaterializeResult::Disabled => {
                    report.skipped += 1
                }
                MaterializeResult::Failed => report.skipped += 1,
            }
        }

        tracing::info!(
            "Replay done: {} read, {} applied, {} deduped",
            report.events_read,
            report.applied,
            report.dedup_hit
        );
        Ok(report)
    }

    /// Replay a sequence window (the HTTP replay contract).
    pub async fn replay_range(&self, seq_from: u64, seq_to: u64) -> events::Result<ReplayReport> {
        let batch = self.log.read_range(seq_from, seq_to)?;

        let mut report = ReplayReport::default();
        for event in batch {
            report.events_read += 1;
            match self.materializer.process(&event).await {
                MaterializeResult::Applied => report.applied += 1,
                MaterializeResult::DedupHit => report.dedup_hit += 1,
                MaterializeResult::Unhandled => report.unhandled += 1,
                _ => report.skipped += 1,
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FlagStore;
    use events::{EventBus, EventDraft, EventKind};
    use graphstore::{DedupeStore, GraphDriver, NodeLabel, ReadQuery};
    use serde_json::json;

    struct Fixture {
        bus: Arc<EventBus>,
        replayer: Replayer,
        materializer: Arc<Materializer>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::new(dir.path().join("events")).unwrap());
        let bus = Arc::new(EventBus::new(log.clone()));
        let driver = Arc::new(
            GraphDriver::connect_with_max_connections("sqlite::memory:", 1)
                .await
                .unwrap(),
        );
        let dedupe = DedupeStore::new(driver.pool().clone());
        let materializer = Arc::new(Materializer::new(driver, dedupe, Arc::new(FlagStore::new())));
        let replayer = Replayer::new(log, materializer.clone());

        Fixture {
            bus,
            replayer,
            materializer,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_replay_builds_graph_from_log() {
        let fx = fixture().await;

        for i in 0..5 {
            fx.bus.publish(
                EventDraft::new(EventKind::ChatMessage)
                    .with_payload(json!({"run_id": format!("r{}", i)})),
            );
        }

        let report = fx.replayer.replay_from(&LogPosition::default()).await.unwrap();
        assert_eq!(report.events_read, 5);
        assert_eq!(report.applied, 5);

        let runs = fx
            .materializer
            .driver()
            .read(&ReadQuery::label(NodeLabel::Run))
            .await
            .unwrap();
        assert_eq!(runs.len(), 5);
    }

    #[tokio::test]
    async fn test_second_replay_is_all_dedupe_hits() {
        let fx = fixture().await;

        for i in 0..10 {
            fx.bus.publish(
                EventDraft::new(EventKind::ChatMessage)
                    .with_payload(json!({"run_id": format!("r{}", i)})),
            );
        }

        let first = fx.replayer.replay_from(&LogPosition::default()).await.unwrap();
        assert_eq!(first.applied, 10);

        let second = fx.replayer.replay_from(&LogPosition::default()).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.dedup_hit, 10);

        // No new nodes appeared.
        let runs = fx
            .materializer
            .driver()
            .read(&ReadQuery::label(NodeLabel::Run))
            .await
            .unwrap();
        assert_eq!(runs.len(), 10);
    }

    #[tokio::test]
    async fn test_checkpoint_resumes_where_left_off() {
        let fx = fixture().await;

        fx.bus.publish(EventDraft::new(EventKind::ChatMessage).with_payload(json!({"run_id": "r1"})));
        let first = fx.replayer.replay_from(&LogPosition::default()).await.unwrap();

        fx.bus.publish(EventDraft::new(EventKind::ChatMessage).with_payload(json!({"run_id": "r2"})));
        let second = fx.replayer.replay_from(&first.position).await.unwrap();

        assert_eq!(second.events_read, 1);
        assert_eq!(second.applied, 1);
    }

    #[tokio::test]
    async fn test_replay_range_window() {
        let fx = fixture().await;

        for i in 0..10 {
            fx.bus.publish(
                EventDraft::new(EventKind::ChatMessage)
                    .with_payload(json!({"run_id": format!("r{}", i)})),
            );
        }

        let report = fx.replayer.replay_range(3, 5).await.unwrap();
        assert_eq!(report.events_read, 3);
    }
}
