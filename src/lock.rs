//! Distributed execution lock
//!
//! A lease row `lock:{execution_id}` holds an opaque owner token and an
//! expiry. Every process pointing at the same SQLite file sees the same
//! leases, so at most one runner drives a given execution. There is no
//! queuing: a failed acquire means "someone else owns it".

use crate::error::StoreError;
use crate::state::StateStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Default lease duration
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

type LockResult<T> = std::result::Result<T, StoreError>;

pub fn lock_key(execution_id: &str) -> String {
    format!("lock:{}", execution_id)
}

/// A held lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub execution_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Lease-based mutual exclusion per execution id
#[derive(Clone)]
pub struct ExecutionLock {
    conn: Arc<Mutex<Connection>>,
    lease: Duration,
}

impl std::fmt::Debug for ExecutionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLock").field("lease", &self.lease).finish()
    }
}

impl ExecutionLock {
    /// Open the lease table in a SQLite file shared by all runners
    pub fn new<P: AsRef<Path>>(db_path: P) -> LockResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::with_connection(Arc::new(Mutex::new(conn)))
    }

    /// Lease table private to this process
    pub fn in_memory() -> LockResult<Self> {
        Self::with_connection(Arc::new(Mutex::new(Connection::open_in_memory()?)))
    }

    /// Lease table in the same database as a state store
    pub fn from_store(store: &StateStore) -> LockResult<Self> {
        Self::with_connection(store.connection())
    }

    fn with_connection(conn: Arc<Mutex<Connection>>) -> LockResult<Self> {
        let lock = Self {
            conn,
            lease: DEFAULT_LEASE,
        };
        lock.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS execution_locks (
                key TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                token TEXT NOT NULL,
                expires_at TIMESTAMP NOT NULL,
                expires_ms INTEGER NOT NULL
            );
            ",
        )?;
        Ok(lock)
    }

    /// Override the default lease duration
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    fn conn(&self) -> LockResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Acquire with the default lease. `false` means another runner owns it.
    pub fn acquire(&self, execution_id: &str) -> LockResult<bool> {
        Ok(self.try_acquire_for(execution_id, self.lease)?.is_some())
    }

    /// Acquire with the default lease, returning the lease on success
    pub fn try_acquire(&self, execution_id: &str) -> LockResult<Option<Lease>> {
        self.try_acquire_for(execution_id, self.lease)
    }

    /// Set `lock:{id}` only if absent or expired
    pub fn try_acquire_for(&self, execution_id: &str, lease: Duration) -> LockResult<Option<Lease>> {
        let key = lock_key(execution_id);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(lease.as_millis().min(i64::MAX as u128) as i64);
        let token = uuid::Uuid::new_v4().to_string();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // A crashed owner's lease simply expires
        tx.execute(
            "DELETE FROM execution_locks WHERE key = ?1 AND expires_ms <= ?2",
            params![key, now.timestamp_millis()],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO execution_locks (key, execution_id, token, expires_at, expires_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, execution_id, token, expires_at, expires_at.timestamp_millis()],
        )?;
        tx.commit()?;

        if inserted == 1 {
            debug!("Acquired {} until {}", key, expires_at);
            Ok(Some(Lease {
                execution_id: execution_id.to_string(),
                token,
                expires_at,
            }))
        } else {
            warn!("Lock contention on {}", key);
            Ok(None)
        }
    }

    /// Extend a lease still owned by `lease.token`. Returns the extended
    /// lease, or `None` if ownership was lost.
    pub fn renew(&self, lease: &Lease) -> LockResult<Option<Lease>> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(self.lease.as_millis().min(i64::MAX as u128) as i64);

        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE execution_locks SET expires_at = ?1, expires_ms = ?2
             WHERE key = ?3 AND token = ?4 AND expires_ms > ?5",
            params![
                expires_at,
                expires_at.timestamp_millis(),
                lock_key(&lease.execution_id),
                lease.token,
                now.timestamp_millis()
            ],
        )?;

        Ok((updated == 1).then(|| Lease {
            expires_at,
            ..lease.clone()
        }))
    }

    /// Delete the lease unconditionally
    pub fn release(&self, execution_id: &str) -> LockResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM execution_locks WHERE key = ?1",
            params![lock_key(execution_id)],
        )?;
        Ok(())
    }

    /// Current unexpired lease, if any
    pub fn holder(&self, execution_id: &str) -> LockResult<Option<Lease>> {
        let conn = self.conn()?;
        let lease = conn
            .query_row(
                "SELECT execution_id, token, expires_at FROM execution_locks
                 WHERE key = ?1 AND expires_ms > ?2",
                params![lock_key(execution_id), Utc::now().timestamp_millis()],
                |row| {
                    Ok(Lease {
                        execution_id: row.get(0)?,
                        token: row.get(1)?,
                        expires_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }
}
