//! SQLite-backed state and checkpoint store
//!
//! Logical layout (one row per key):
//! - `execution:{id}` full serialized context, expiring after the TTL
//! - `checkpoint:{id}:{n}` append-only snapshots
//! - `workflow:{id}:executions` membership set used for listing
//! - the definition an execution was started with, for resume
//!
//! The store only ever holds serialized snapshots. The live context belongs
//! to the scheduler driving the execution.

use crate::error::StoreError;
use crate::models::{CheckpointDescriptor, ExecutionStatus, WorkflowDefinition, WorkflowExecutionContext};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Default time-to-live of execution state
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

type StoreResult<T> = std::result::Result<T, StoreError>;

pub fn execution_key(execution_id: &str) -> String {
    format!("execution:{}", execution_id)
}

pub fn checkpoint_key(execution_id: &str, index: usize) -> String {
    format!("checkpoint:{}:{}", execution_id, index)
}

pub fn workflow_executions_key(workflow_id: &str) -> String {
    format!("workflow:{}:executions", workflow_id)
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub executions: usize,
    pub checkpoints: usize,
}

/// Aggregate over persisted executions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
    pub running_executions: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Mean duration of finished executions, seconds
    pub avg_duration: f64,
}

/// Durable store for execution contexts and checkpoints
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("ttl", &self.ttl).finish()
    }
}

impl StateStore {
    /// Open (or create) a store backed by a SQLite file
    pub fn new<P: AsRef<Path>>(db_path: P) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA busy_timeout = 5000;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        Self::from_connection(conn)
    }

    /// In-memory store, for tests and one-shot runs
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl: DEFAULT_STATE_TTL,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Override the state TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Shared connection, so the execution lock can live in the same database
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TIMESTAMP NOT NULL,
                start_ms INTEGER NOT NULL,
                duration REAL,
                body TEXT NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                expires_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                descriptor TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                UNIQUE (execution_id, idx)
            );

            CREATE TABLE IF NOT EXISTS workflow_executions (
                set_key TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                PRIMARY KEY (set_key, execution_id)
            );

            CREATE TABLE IF NOT EXISTS execution_definitions (
                execution_id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_workflow_start ON executions(workflow_id, start_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_expires ON executions(expires_ms);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_execution ON checkpoints(execution_id, idx);
            ",
        )?;

        Ok(())
    }

    /// Persist the context, optionally appending a checkpoint.
    ///
    /// With `create_checkpoint` the descriptor (index one past the highest
    /// known checkpoint) is appended to `context.checkpoints` before anything is written,
    /// so both the execution row and the snapshot list it.
    pub fn save(
        &self,
        context: &mut WorkflowExecutionContext,
        create_checkpoint: bool,
    ) -> StoreResult<Option<CheckpointDescriptor>> {
        let descriptor = create_checkpoint.then(|| {
            let descriptor = new_checkpoint_descriptor(context);
            context.checkpoints.push(descriptor.clone());
            descriptor
        });

        self.write_snapshot(context, descriptor.as_ref())?;
        Ok(descriptor)
    }

    /// Write an already-prepared snapshot. `checkpoint` must be the last
    /// entry of `context.checkpoints` when present; it is stored under its
    /// own index.
    pub fn write_snapshot(
        &self,
        context: &WorkflowExecutionContext,
        checkpoint: Option<&CheckpointDescriptor>,
    ) -> StoreResult<()> {
        let body = serde_json::to_string(context)?;
        let now = Utc::now();
        let expires_ms = now.timestamp_millis() + self.ttl.as_millis().min(i64::MAX as u128) as i64;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO executions (execution_id, key, workflow_id, status, start_time, start_ms, duration, body, updated_at, expires_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(execution_id) DO UPDATE SET
                status = excluded.status,
                duration = excluded.duration,
                body = excluded.body,
                updated_at = excluded.updated_at,
                expires_ms = excluded.expires_ms",
            params![
                context.execution_id,
                execution_key(&context.execution_id),
                context.workflow_id,
                context.status.to_string(),
                context.start_time,
                context.start_time.timestamp_millis(),
                context.duration_secs(),
                body,
                now,
                expires_ms,
            ],
        )?;

        tx.execute(
            "INSERT OR IGNORE INTO workflow_executions (set_key, execution_id) VALUES (?1, ?2)",
            params![workflow_executions_key(&context.workflow_id), context.execution_id],
        )?;

        if let Some(descriptor) = checkpoint {
            let index = descriptor.index;
            tx.execute(
                "INSERT INTO checkpoints (key, execution_id, idx, descriptor, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    descriptor.key,
                    context.execution_id,
                    index as i64,
                    serde_json::to_string(descriptor)?,
                    body,
                    descriptor.timestamp,
                ],
            )?;
            debug!("Wrote {} for execution {}", descriptor.key, context.execution_id);
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the latest persisted context
    pub fn load(&self, execution_id: &str) -> StoreResult<WorkflowExecutionContext> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM executions WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::NotFound(execution_key(execution_id))),
        }
    }

    /// Load one checkpoint snapshot
    pub fn load_checkpoint(&self, execution_id: &str, index: usize) -> StoreResult<WorkflowExecutionContext> {
        let key = checkpoint_key(execution_id, index);
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM checkpoints WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::NotFound(key)),
        }
    }

    /// Checkpoint descriptors of an execution, oldest first
    pub fn list_checkpoints(&self, execution_id: &str) -> StoreResult<Vec<CheckpointDescriptor>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT descriptor FROM checkpoints WHERE execution_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![execution_id], |row| row.get::<_, String>(0))?;

        let mut descriptors = Vec::new();
        for row in rows {
            descriptors.push(serde_json::from_str(&row?)?);
        }
        Ok(descriptors)
    }

    /// Context ready to hand back to the scheduler.
    ///
    /// Step statuses in the snapshot are kept. Status is reset to `running`
    /// and `end_time`/`error` are cleared. The checkpoint list is replaced by
    /// every checkpoint stored for the execution so new checkpoints never
    /// reuse an index.
    pub fn resume_from(&self, execution_id: &str, index: usize) -> StoreResult<WorkflowExecutionContext> {
        let mut context = self.load_checkpoint(execution_id, index)?;
        context.status = ExecutionStatus::Running;
        context.end_time = None;
        context.error = None;
        context.checkpoints = self.list_checkpoints(execution_id)?;

        info!("Resuming execution {} from checkpoint {}", execution_id, index);
        Ok(context)
    }

    /// Execution ids of a workflow, newest start first
    pub fn list_executions(&self, workflow_id: &str, limit: usize) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.execution_id
             FROM workflow_executions w
             JOIN executions e ON e.execution_id = w.execution_id
             WHERE w.set_key = ?1
             ORDER BY e.start_ms DESC
             LIMIT ?2",
        )?;

        let ids = stmt
            .query_map(
                params![workflow_executions_key(workflow_id), limit.min(i64::MAX as usize) as i64],
                |row| row.get(0),
            )?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(ids)
    }

    /// Store the definition an execution runs
    pub fn save_definition(&self, execution_id: &str, definition: &WorkflowDefinition) -> StoreResult<()> {
        let body = serde_json::to_string(definition)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO execution_definitions (execution_id, body) VALUES (?1, ?2)",
            params![execution_id, body],
        )?;
        Ok(())
    }

    pub fn load_definition(&self, execution_id: &str) -> StoreResult<WorkflowDefinition> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM execution_definitions WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::NotFound(format!("definition of {}", execution_id))),
        }
    }

    /// Delete every execution whose TTL has elapsed
    pub fn cleanup_expired(&self) -> StoreResult<CleanupReport> {
        self.cleanup_expired_at(Utc::now())
    }

    /// Delete every execution whose TTL elapsed before `now`, with its
    /// checkpoints, set membership and definition
    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> StoreResult<CleanupReport> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let expired: Vec<String> = {
            let mut stmt = tx.prepare("SELECT execution_id FROM executions WHERE expires_ms <= ?1")?;
            let ids = stmt
                .query_map(params![now.timestamp_millis()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            ids
        };

        let mut report = CleanupReport::default();
        for id in &expired {
            report.checkpoints += tx.execute("DELETE FROM checkpoints WHERE execution_id = ?1", params![id])?;
            tx.execute("DELETE FROM workflow_executions WHERE execution_id = ?1", params![id])?;
            tx.execute("DELETE FROM execution_definitions WHERE execution_id = ?1", params![id])?;
            report.executions += tx.execute("DELETE FROM executions WHERE execution_id = ?1", params![id])?;
        }

        tx.commit()?;

        if report.executions > 0 {
            info!(
                "Cleaned up {} expired executions ({} checkpoints)",
                report.executions, report.checkpoints
            );
        }
        Ok(report)
    }

    /// Totals and rates over executions started since `since`, optionally for one workflow
    pub fn execution_stats(&self, workflow_id: Option<&str>, since: DateTime<Utc>) -> StoreResult<ExecutionStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, duration FROM executions
             WHERE start_ms >= ?1 AND (?2 IS NULL OR workflow_id = ?2)",
        )?;
        let rows = stmt.query_map(params![since.timestamp_millis(), workflow_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
        })?;

        let mut stats = ExecutionStats::default();
        let mut duration_sum = 0.0;
        let mut finished = 0u64;

        for row in rows {
            let (status, duration) = row?;
            stats.total_executions += 1;
            match status.as_str() {
                "completed" => stats.completed_executions += 1,
                "error" => stats.failed_executions += 1,
                _ => stats.running_executions += 1,
            }
            if let Some(d) = duration {
                duration_sum += d;
                finished += 1;
            }
        }

        if stats.total_executions > 0 {
            let total = stats.total_executions as f64;
            stats.success_rate = stats.completed_executions as f64 / total;
            stats.failure_rate = stats.failed_executions as f64 / total;
        }
        if finished > 0 {
            stats.avg_duration = duration_sum / finished as f64;
        }

        Ok(stats)
    }
}

/// Descriptor for the next checkpoint of `context`, one past the highest
/// index it knows of
pub fn new_checkpoint_descriptor(context: &WorkflowExecutionContext) -> CheckpointDescriptor {
    let index = context
        .checkpoints
        .iter()
        .map(|c| c.index + 1)
        .max()
        .unwrap_or(0);
    CheckpointDescriptor {
        checkpoint_id: uuid::Uuid::new_v4().to_string(),
        index,
        timestamp: Utc::now(),
        step_count: context.steps.len(),
        key: checkpoint_key(&context.execution_id, index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStep, StepStatus};
    use serde_json::Map;

    fn definition() -> WorkflowDefinition {
        serde_yaml::from_str(
            "id: wf\nname: test\nnodes:\n  - id: a\n    type: input\n  - id: b\n    type: output\n",
        )
        .unwrap()
    }

    fn context() -> WorkflowExecutionContext {
        WorkflowExecutionContext::new(&definition(), Map::new())
    }

    fn backdate(store: &StateStore, execution_id: &str) {
        let conn = store.conn().unwrap();
        conn.execute(
            "UPDATE executions SET expires_ms = 0 WHERE execution_id = ?1",
            params![execution_id],
        )
        .unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let store = StateStore::in_memory().unwrap();
        let mut ctx = context();
        assert!(store.save(&mut ctx, false).unwrap().is_none());

        let loaded = store.load(&ctx.execution_id).unwrap();
        assert_eq!(loaded, ctx);
        assert!(matches!(store.load("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_checkpoint_index_follows_count() {
        let store = StateStore::in_memory().unwrap();
        let mut ctx = context();

        let first = store.save(&mut ctx, true).unwrap().unwrap();
        let second = store.save(&mut ctx, true).unwrap().unwrap();

        assert_eq!(first.key, checkpoint_key(&ctx.execution_id, 0));
        assert_eq!(second.key, checkpoint_key(&ctx.execution_id, 1));
        assert_eq!(ctx.checkpoints.len(), 2);
        assert_eq!(store.list_checkpoints(&ctx.execution_id).unwrap().len(), 2);
        assert_eq!(store.load(&ctx.execution_id).unwrap().checkpoints.len(), 2);
    }

    #[test]
    fn test_resume_after_dropped_checkpoint_skips_the_gap() {
        let store = StateStore::in_memory().unwrap();
        let mut ctx = context();
        store.save(&mut ctx, true).unwrap();

        // Descriptor 1 was handed out but its write never landed
        let lost = new_checkpoint_descriptor(&ctx);
        assert_eq!(lost.index, 1);
        ctx.checkpoints.push(lost);

        let third = store.save(&mut ctx, true).unwrap().unwrap();
        assert_eq!(third.index, 2);
        assert_eq!(third.key, checkpoint_key(&ctx.execution_id, 2));

        let mut resumed = store.resume_from(&ctx.execution_id, 2).unwrap();
        let indices: Vec<usize> = resumed.checkpoints.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 2]);

        let next = store.save(&mut resumed, true).unwrap().unwrap();
        assert_eq!(next.index, 3);
        assert_eq!(store.list_checkpoints(&ctx.execution_id).unwrap().len(), 3);
        assert!(matches!(store.load_checkpoint(&ctx.execution_id, 1), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_checkpoint_is_immutable_snapshot() {
        let store = StateStore::in_memory().unwrap();
        let def = definition();
        let mut ctx = context();
        let mut step = ExecutionStep::start(&def.nodes[0], Map::new());
        step.finish(StepStatus::Completed);
        ctx.upsert_step(step);
        store.save(&mut ctx, true).unwrap();

        ctx.status = ExecutionStatus::Error;
        ctx.error = Some("later failure".to_string());
        ctx.end_time = Some(Utc::now());
        store.save(&mut ctx, false).unwrap();

        let resumed = store.resume_from(&ctx.execution_id, 0).unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert!(resumed.error.is_none());
        assert!(resumed.end_time.is_none());
        assert_eq!(resumed.steps.len(), 1);
        assert_eq!(resumed.steps[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_list_executions_newest_first() {
        let store = StateStore::in_memory().unwrap();
        let mut ids = Vec::new();
        for offset in 0..3 {
            let mut ctx = context();
            ctx.start_time = Utc::now() + chrono::Duration::seconds(offset);
            store.save(&mut ctx, false).unwrap();
            ids.push(ctx.execution_id.clone());
        }

        let listed = store.list_executions("wf", 10).unwrap();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone(), ids[0].clone()]);
        assert_eq!(store.list_executions("wf", 2).unwrap().len(), 2);
        assert!(store.list_executions("other", 10).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let store = StateStore::in_memory().unwrap();
        let mut old = context();
        store.save(&mut old, true).unwrap();
        store.save(&mut old, true).unwrap();
        store.save_definition(&old.execution_id, &definition()).unwrap();
        let mut fresh = context();
        store.save(&mut fresh, true).unwrap();

        backdate(&store, &old.execution_id);
        let report = store.cleanup_expired().unwrap();

        assert_eq!(report, CleanupReport { executions: 1, checkpoints: 2 });
        assert!(store.load(&old.execution_id).is_err());
        assert!(store.load_checkpoint(&old.execution_id, 0).is_err());
        assert!(store.load_definition(&old.execution_id).is_err());
        assert!(store.load(&fresh.execution_id).is_ok());
        assert!(store.load_checkpoint(&fresh.execution_id, 0).is_ok());
        assert_eq!(store.list_executions("wf", 10).unwrap(), vec![fresh.execution_id.clone()]);
    }

    #[test]
    fn test_definition_round_trip() {
        let store = StateStore::in_memory().unwrap();
        store.save_definition("exec-1", &definition()).unwrap();
        assert_eq!(store.load_definition("exec-1").unwrap(), definition());
    }

    #[test]
    fn test_execution_stats() {
        let store = StateStore::in_memory().unwrap();
        let since = Utc::now() - chrono::Duration::minutes(1);

        for status in [ExecutionStatus::Completed, ExecutionStatus::Completed, ExecutionStatus::Error] {
            let mut ctx = context();
            ctx.status = status;
            ctx.end_time = Some(ctx.start_time + chrono::Duration::seconds(2));
            store.save(&mut ctx, false).unwrap();
        }
        let mut running = context();
        store.save(&mut running, false).unwrap();

        let stats = store.execution_stats(Some("wf"), since).unwrap();
        assert_eq!(stats.total_executions, 4);
        assert_eq!(stats.completed_executions, 2);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.running_executions, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.avg_duration, 2.0);
    }
}
