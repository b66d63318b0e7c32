//! Background persistence queue
//!
//! Snapshot and checkpoint writes are detached from the dispatch loop: the
//! scheduler enqueues a serialized copy and moves on. A single worker drains
//! the bounded queue onto the blocking pool. Failures and overflow are
//! logged and counted, never surfaced to the execution.

use crate::models::{CheckpointDescriptor, WorkflowExecutionContext};
use crate::state::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

enum PersistJob {
    Snapshot {
        context: Box<WorkflowExecutionContext>,
        checkpoint: Option<CheckpointDescriptor>,
    },
    Flush(oneshot::Sender<()>),
}

/// Counters since the queue started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Handle for enqueueing fire-and-forget writes
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl PersistenceQueue {
    /// Start the worker. Must be called from within a Tokio runtime.
    pub fn spawn(store: StateStore, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(store, rx, Arc::clone(&counters)));
        Self { tx, counters }
    }

    /// Queue a snapshot of `context`, with its newest checkpoint when given.
    /// Drops the write with a warning if the queue is full.
    pub fn enqueue_snapshot(&self, context: &WorkflowExecutionContext, checkpoint: Option<CheckpointDescriptor>) {
        let job = PersistJob::Snapshot {
            context: Box::new(context.clone()),
            checkpoint,
        };

        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Persistence queue full, dropping snapshot of execution {}",
                    context.execution_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Persistence worker stopped, dropping snapshot of execution {}", context.execution_id);
            }
        }
    }

    /// Wait until every job queued before this call has been processed
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistJob::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(store: StateStore, mut rx: mpsc::Receiver<PersistJob>, counters: Arc<Counters>) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Snapshot { context, checkpoint } => {
                let store = store.clone();
                let execution_id = context.execution_id.clone();
                let result = tokio::task::spawn_blocking(move || {
                    store.write_snapshot(&context, checkpoint.as_ref())
                })
                .await;

                match result {
                    Ok(Ok(())) => {
                        counters.written.fetch_add(1, Ordering::Relaxed);
                        debug!("Persisted snapshot of execution {}", execution_id);
                    }
                    Ok(Err(e)) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Failed to persist execution {}: {}", execution_id, e);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!("Persistence task for execution {} panicked: {}", execution_id, e);
                    }
                }
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Persistence worker stopped");
}
