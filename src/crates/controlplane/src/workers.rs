//! Async worker pool
//!
//! Named queues with per-queue concurrency caps for everything that must
//! not block the request path: heavy materialization, long tool calls,
//! speech synthesis and housekeeping. Dispatch probes the broker within a
//! bounded window and fails open to inline synchronous execution. Final
//! failures land in the dead-letter log and emit `task.failed`; every
//! queue heartbeats `worker.seen`.

use crate::config::AppConfig;
use crate::flags::{FlagStore, FLAG_ASYNC_ENABLED};
use chrono::Utc;
use dashmap::DashMap;
use events::{EventBus, EventDraft, EventKind};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tooling::retry::RetryPolicy;

/// Queue capacity before dispatch falls back to inline execution
const QUEUE_CAPACITY: usize = 256;

/// The named queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Read-only tool calls
    ToolsRo,
    /// Mutating tool calls
    ToolsMut,
    /// Heavy graph ingestion
    GraphIngestHeavy,
    /// Speech synthesis
    Tts,
    /// Sweeps and pruning
    Housekeeping,
}

impl QueueName {
    /// All queues, in heartbeat order
    pub const ALL: [QueueName; 5] = [
        QueueName::ToolsRo,
        QueueName::ToolsMut,
        QueueName::GraphIngestHeavy,
        QueueName::Tts,
        QueueName::Housekeeping,
    ];

    /// Stable queue name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ToolsRo => "tools_ro",
            QueueName::ToolsMut => "tools_mut",
            QueueName::GraphIngestHeavy => "graph_ingest_heavy",
            QueueName::Tts => "tts",
            QueueName::Housekeeping => "housekeeping",
        }
    }

    /// Concurrent tasks allowed on this queue
    pub fn concurrency(&self) -> usize {
        match self {
            QueueName::ToolsRo => 4,
            QueueName::ToolsMut => 1,
            QueueName::GraphIngestHeavy => 2,
            QueueName::Tts => 2,
            QueueName::Housekeeping => 1,
        }
    }

    /// Extra attempts after the first failure
    pub fn retries(&self) -> usize {
        match self {
            QueueName::ToolsMut => 3,
            QueueName::ToolsRo => 1,
            QueueName::GraphIngestHeavy => 2,
            QueueName::Tts => 1,
            QueueName::Housekeeping => 1,
        }
    }
}

/// One unit of background work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Task id
    pub id: String,
    /// Queue to run on
    pub queue: QueueName,
    /// Handler name
    pub kind: String,
    /// Handler input
    pub payload: Value,
}

impl WorkItem {
    /// Create a work item with a random id
    pub fn new(queue: QueueName, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue,
            kind: kind.into(),
            payload,
        }
    }
}

/// How a dispatch was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Enqueued to the broker
    Queued,
    /// Executed inline because the broker was unreachable or disabled
    RanInline,
}

/// Handler invoked for a work item kind
pub type TaskHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Append-only dead-letter log
pub struct DeadLetter {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl DeadLetter {
    /// Open (or create) the dead-letter directory.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writer: Mutex::new(()),
        })
    }

    /// Append a failed item with its error.
    pub fn append(&self, item: &WorkItem, error: &str) -> std::io::Result<()> {
        let line = serde_json::to_string(&json!({
            "item": item,
            "error": error,
            "ts": Utc::now().to_rfc3339(),
        }))?;

        let _guard = self.writer.lock();
        let path = self
            .dir
            .join(format!("deadletter-{}.jsonl", Utc::now().format("%Y%m%d")));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// All dead-lettered lines, for operators and tests.
    pub fn entries(&self) -> std::io::Result<Vec<Value>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let content = std::fs::read_to_string(entry?.path())?;
            for line in content.lines() {
                if let Ok(value) = serde_json::from_str(line) {
                    out.push(value);
                }
            }
        }
        Ok(out)
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Items currently queued per queue
    pub queue_depth: HashMap<&'static str, i64>,
    /// Items executed to completion
    pub executed: u64,
    /// Items that exhausted their retries
    pub failed: u64,
    /// Items written to the dead-letter log
    pub deadlettered: u64,
    /// Dispatches served inline
    pub fallback_sync: u64,
    /// Last heartbeat (epoch millis), 0 when none was sent yet
    pub last_heartbeat_ms: i64,
}

struct PoolCounters {
    depth: HashMap<&'static str, AtomicI64>,
    executed: AtomicU64,
    failed: AtomicU64,
    deadlettered: AtomicU64,
    fallback_sync: AtomicU64,
    last_heartbeat_ms: AtomicI64,
}

/// The worker pool
pub struct WorkerPool {
    handlers: DashMap<String, TaskHandler>,
    senders: HashMap<&'static str, mpsc::Sender<WorkItem>>,
    bus: Arc<EventBus>,
    flags: Arc<FlagStore>,
    config: AppConfig,
    deadletter: Arc<DeadLetter>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Create the pool and spawn one consumer loop per queue.
    pub fn new(
        bus: Arc<EventBus>,
        flags: Arc<FlagStore>,
        config: AppConfig,
        deadletter: Arc<DeadLetter>,
    ) -> Arc<Self> {
        let mut depth = HashMap::new();
        for queue in QueueName::ALL {
            depth.insert(queue.as_str(), AtomicI64::new(0));
        }

        let counters = Arc::new(PoolCounters {
            depth,
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deadlettered: AtomicU64::new(0),
            fallback_sync: AtomicU64::new(0),
            last_heartbeat_ms: AtomicI64::new(0),
        });

        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for queue in QueueName::ALL {
            let (tx, rx) = mpsc::channel::<WorkItem>(QUEUE_CAPACITY);
            senders.insert(queue.as_str(), tx);
            receivers.push((queue, rx));
        }

        let pool = Arc::new(Self {
            handlers: DashMap::new(),
            senders,
            bus,
            flags,
            config,
            deadletter,
            counters,
        });

        for (queue, mut rx) in receivers {
            let pool = pool.clone();
            let semaphore = Arc::new(Semaphore::new(queue.concurrency()));
            tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    pool.counters.depth[queue.as_str()].fetch_sub(1, Ordering::Relaxed);
                    let permit = semaphore.clone().acquire_owned().await;
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _ = pool.execute(&item).await;
                    });
                }
            });
        }

        pool
    }

    /// Register the handler for a work item kind.
    pub fn register_handler(&self, kind: impl Into<String>, handler: TaskHandler) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Dispatch a work item.
    ///
    /// Probes the broker within the configured bound; an unreachable or
    /// disabled broker executes the item inline and emits
    /// `async.fallback_sync`.
    pub async fn dispatch(&self, item: WorkItem) -> DispatchResult {
        let broker_up = self.flags.bool_flag(FLAG_ASYNC_ENABLED, true)
            && tooling::timeout::with_deadline(self.config.broker_probe_timeout, self.probe())
                .await
                .unwrap_or(false);

        if broker_up {
            let queue = item.queue;
            if let Some(sender) = self.senders.get(queue.as_str()) {
                match sender.try_send(item) {
                    Ok(()) => {
                        self.counters.depth[queue.as_str()].fetch_add(1, Ordering::Relaxed);
                        return DispatchResult::Queued;
                    }
                    Err(mpsc::error::TrySendError::Full(item))
                    | Err(mpsc::error::TrySendError::Closed(item)) => {
                        return self.run_inline(item).await;
                    }
                }
            }
        }

        self.run_inline(item).await
    }

    async fn run_inline(&self, item: WorkItem) -> DispatchResult {
        self.counters.fallback_sync.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(
            EventDraft::new(EventKind::AsyncFallbackSync)
                .with_payload(json!({"task_id": &item.id, "queue": item.queue.as_str()})),
        );
        let _ = self.execute(&item).await;
        DispatchResult::RanInline
    }

    /// Broker reachability probe.
    async fn probe(&self) -> bool {
        self.senders.values().all(|tx| !tx.is_closed())
    }

    /// Execute a work item with retries, a per-task timeout and
    /// dead-lettering on final failure.
    async fn execute(&self, item: &WorkItem) -> Result<Value, String> {
        let handler = match self.handlers.get(&item.kind) {
            Some(handler) => handler.clone(),
            None => {
                let error = format!("no handler for kind {}", item.kind);
                self.finalize_failure(item, &error);
                return Err(error);
            }
        };

        let policy = RetryPolicy::new(item.queue.retries() + 1)
            .with_initial_interval(Duration::from_millis(200));
        let timeout = self.config.task_timeout;
        let payload = item.payload.clone();

        let result = tooling::retry::with_retry(&policy, move || {
            let handler = handler.clone();
            let payload = payload.clone();
            async move {
                match tokio::time::timeout(timeout, handler(payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("task timed out after {:?}", timeout)),
                }
            }
        })
        .await;

        match result {
            Ok(value) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(error) => {
                self.finalize_failure(item, &error);
                Err(error)
            }
        }
    }

    fn finalize_failure(&self, item: &WorkItem, error: &str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        if self.deadletter.append(item, error).is_ok() {
            self.counters.deadlettered.fetch_add(1, Ordering::Relaxed);
        }
        self.bus.publish(EventDraft::new(EventKind::TaskFailed).with_payload(json!({
            "task_id": &item.id,
            "queue": item.queue.as_str(),
            "reason": error,
        })));
        tracing::warn!("Work item {} ({}) dead-lettered: {}", item.id, item.kind, error);
    }

    /// Spawn the heartbeat loop.
    pub fn spawn_heartbeats(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                pool.heartbeat();
            }
        });
    }

    /// Emit one round of `worker.seen` heartbeats.
    pub fn heartbeat(&self) {
        for queue in QueueName::ALL {
            self.bus.publish(
                EventDraft::new(EventKind::WorkerSeen)
                    .with_payload(json!({"worker": queue.as_str()})),
            );
        }
        self.counters
            .last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Snapshot of pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            queue_depth: self
                .counters
                .depth
                .iter()
                .map(|(name, depth)| (*name, depth.load(Ordering::Relaxed)))
                .collect(),
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            deadlettered: self.counters.deadlettered.load(Ordering::Relaxed),
            fallback_sync: self.counters.fallback_sync.load(Ordering::Relaxed),
            last_heartbeat_ms: self.counters.last_heartbeat_ms.load(Ordering::Relaxed),
        }
    }
}
