//! Periodic cleanup of expired state
//!
//! A repeated tokio-cron-scheduler job removes executions whose TTL has
//! passed (with their checkpoints and set memberships) and resolves stale
//! monitor alerts.
//!
//! # Example
//!
//! ```no_run
//! use kbflow::state::StateStore;
//! use kbflow::sweeper::CleanupSweeper;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = StateStore::new("kbflow.db")?;
//! let mut sweeper = CleanupSweeper::new(store, Duration::from_secs(3600)).await?;
//! sweeper.start().await?;
//! // ...
//! sweeper.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{FlowError, Result};
use crate::monitor::PerformanceMonitor;
use crate::state::{CleanupReport, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub removed: CleanupReport,
    pub alerts_resolved: usize,
}

/// Run one sweep now
pub async fn sweep_once(store: &StateStore, monitor: Option<&PerformanceMonitor>) -> Result<SweepReport> {
    let store = store.clone();
    let removed = tokio::task::spawn_blocking(move || store.cleanup_expired())
        .await
        .map_err(|e| FlowError::Other(format!("Cleanup task failed: {}", e)))??;
    let alerts_resolved = monitor.map(PerformanceMonitor::resolve_stale).unwrap_or(0);

    Ok(SweepReport {
        removed,
        alerts_resolved,
    })
}

#[derive(Debug, Default)]
struct SweepLog {
    runs: AtomicU64,
    last: Mutex<Option<SweepReport>>,
}

/// Background sweeper
pub struct CleanupSweeper {
    scheduler: JobScheduler,
    store: StateStore,
    monitor: Option<Arc<PerformanceMonitor>>,
    interval: Duration,
    log: Arc<SweepLog>,
}

impl CleanupSweeper {
    pub async fn new(store: StateStore, interval: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| FlowError::Other(format!("Failed to create job scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            store,
            monitor: None,
            interval,
            log: Arc::new(SweepLog::default()),
        })
    }

    /// Also resolve stale alerts of `monitor` on every sweep
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Register the repeated job and start ticking
    pub async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let monitor = self.monitor.clone();
        let log = Arc::clone(&self.log);

        let job = Job::new_repeated_async(self.interval, move |_uuid, _lock| {
            let store = store.clone();
            let monitor = monitor.clone();
            let log = Arc::clone(&log);

            Box::pin(async move {
                match sweep_once(&store, monitor.as_deref()).await {
                    Ok(report) => {
                        info!(
                            "Sweep removed {} executions and {} checkpoints, resolved {} alerts",
                            report.removed.executions, report.removed.checkpoints, report.alerts_resolved
                        );
                        log.runs.fetch_add(1, Ordering::Relaxed);
                        *log.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
                    }
                    Err(e) => error!("Sweep failed: {}", e),
                }
            })
        })
        .map_err(|e| FlowError::Other(format!("Failed to create sweep job: {}", e)))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| FlowError::Other(format!("Failed to add sweep job: {}", e)))?;
        self.scheduler
            .start()
            .await
            .map_err(|e| FlowError::Other(format!("Failed to start sweeper: {}", e)))?;

        info!("Cleanup sweeper running every {:?}", self.interval);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| FlowError::Other(format!("Failed to stop sweeper: {}", e)))?;
        info!("Cleanup sweeper stopped");
        Ok(())
    }

    /// Completed sweeps since start
    pub fn runs(&self) -> u64 {
        self.log.runs.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        *self.log.last.lock().unwrap_or_else(|p| p.into_inner())
    }
}
