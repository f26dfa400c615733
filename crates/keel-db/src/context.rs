//! # Persistence Context
//!
//! One lazily opened SQLite connection plus the change tracker and identity
//! map of a single unit of work.
//!
//! ## Ownership
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           DbContext                                     │
//! │                                                                         │
//! │  session  : tokio Mutex<Session>     ← held across awaits               │
//! │     ├── ConnectionString (Database=<name>; rewritable)                  │
//! │     └── Option<SqliteConnection>     (opened on first use)              │
//! │                                                                         │
//! │  tracking : std Mutex<Tracking>      ← never held across awaits         │
//! │     ├── ChangeTracker                (pending INSERT/UPDATE/DELETE)     │
//! │     └── identity map                 ((table, key) → entity)            │
//! │                                                                         │
//! │  stats    : reads / writes round-trip counters                          │
//! │                                                                         │
//! │  Shared by every Repository<T> of one UnitOfWork via Arc<DbContext>.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Saving
//! Pending entries are drained, executed in queue order inside one
//! transaction, and restored to the tracker if anything fails. Foreign keys
//! are checked at COMMIT, so a child may be queued before its parent. Saving
//! several contexts together begins a transaction on each, flushes them one
//! after another, and commits only when every flush and foreign key check
//! succeeded.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use keel_core::{ChangeTracker, Entity, EntityState, Entry, Statement, Value};
use serde::Serialize;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, FromRow};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::connection::ConnectionString;
use crate::error::{DbError, DbResult};
use crate::schema::{self, SchemaPlan};

// =============================================================================
// Parameter Binding
// =============================================================================

/// Binds each [`Value`] onto a sqlx `query`, `query_as` or `query_scalar`.
macro_rules! bind_values {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for value in $params {
            query = match value {
                Value::Null => query.bind(None::<i64>),
                Value::Integer(v) => query.bind(v),
                Value::Real(v) => query.bind(v),
                Value::Text(v) => query.bind(v),
                Value::Bool(v) => query.bind(v),
                Value::Blob(v) => query.bind(v),
            };
        }
        query
    }};
}

/// Runs a statement, returning rows affected.
pub(crate) async fn execute(
    conn: &mut SqliteConnection,
    stmt: &Statement,
    stats: &Stats,
) -> DbResult<u64> {
    let query = bind_values!(sqlx::query::<Sqlite>(&stmt.sql), stmt.params.iter().cloned());
    let result = query.execute(&mut *conn).await?;
    stats.record_write();
    Ok(result.rows_affected())
}

/// Runs a query, decoding every row as `T`.
pub(crate) async fn fetch_all<T>(
    conn: &mut SqliteConnection,
    stmt: &Statement,
    stats: &Stats,
) -> DbResult<Vec<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let query = bind_values!(
        sqlx::query_as::<Sqlite, T>(&stmt.sql),
        stmt.params.iter().cloned()
    );
    let rows = query.fetch_all(&mut *conn).await?;
    stats.record_read();
    Ok(rows)
}

/// Runs a query, decoding the first column of every row as `V`.
pub(crate) async fn fetch_scalars<V>(
    conn: &mut SqliteConnection,
    stmt: &Statement,
    stats: &Stats,
) -> DbResult<Vec<V>>
where
    V: Send + Unpin,
    (V,): for<'r> FromRow<'r, SqliteRow>,
{
    let query = bind_values!(
        sqlx::query_scalar::<Sqlite, V>(&stmt.sql),
        stmt.params.iter().cloned()
    );
    let values = query.fetch_all(&mut *conn).await?;
    stats.record_read();
    Ok(values)
}

/// Runs a `SELECT COUNT(*)`.
pub(crate) async fn fetch_count(
    conn: &mut SqliteConnection,
    stmt: &Statement,
    stats: &Stats,
) -> DbResult<i64> {
    let query = bind_values!(
        sqlx::query_scalar::<Sqlite, i64>(&stmt.sql),
        stmt.params.iter().cloned()
    );
    let count = query.fetch_one(&mut *conn).await?;
    stats.record_read();
    Ok(count)
}

/// Defers foreign-key checks on the open transaction to its COMMIT, so
/// queued rows may reference parents queued after them.
async fn defer_foreign_keys(conn: &mut SqliteConnection) -> DbResult<()> {
    sqlx::query::<Sqlite>("PRAGMA defer_foreign_keys = ON")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Fails with `ForeignKeyViolation` when the open transaction holds rows
/// whose parents are missing.
///
/// Lets a multi-context save reject a participant before anything commits,
/// instead of at its deferred COMMIT.
async fn check_foreign_keys(conn: &mut SqliteConnection) -> DbResult<()> {
    let violation: Option<String> =
        sqlx::query_scalar::<Sqlite, String>("PRAGMA foreign_key_check")
            .fetch_optional(&mut *conn)
            .await?;

    match violation {
        None => Ok(()),
        Some(table) => Err(DbError::ForeignKeyViolation {
            message: format!("FOREIGN KEY constraint failed on {}", table),
        }),
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Round-trip counters.
#[derive(Debug, Default)]
pub struct Stats {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Stats {
    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a context's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Diagnostics {
    /// SELECT round trips.
    pub reads: u64,
    /// INSERT / UPDATE / DELETE / raw statement round trips.
    pub writes: u64,
}

// =============================================================================
// Session
// =============================================================================

/// The connection half of a context.
pub(crate) struct Session {
    connection_string: ConnectionString,
    busy_timeout: Duration,
    ensure_schema: bool,
    schema: SchemaPlan,
    conn: Option<SqliteConnection>,
}

impl Session {
    /// The open connection, opening it on first use.
    pub(crate) async fn connection(&mut self) -> DbResult<&mut SqliteConnection> {
        if self.conn.is_none() {
            let conn = self.open(&self.connection_string).await?;
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::Internal("connection slot empty after open".to_string()))
    }

    /// Whether the current target enforces foreign keys.
    fn foreign_keys(&self) -> bool {
        self.connection_string.foreign_keys().unwrap_or(true)
    }

    async fn open(&self, target: &ConnectionString) -> DbResult<SqliteConnection> {
        let options = target.connect_options(self.busy_timeout)?;
        let mut conn = options
            .connect()
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        if self.ensure_schema {
            schema::ensure(&mut conn, &self.schema).await?;
        }

        info!(
            database = target.database().unwrap_or("main"),
            schema = self.schema.name,
            "Context connection opened"
        );
        Ok(conn)
    }

    /// Points the session at another database.
    ///
    /// The new connection is opened before the old one is closed, so a
    /// failed switch leaves the session exactly as it was.
    async fn switch(&mut self, name: &str) -> DbResult<()> {
        if self.connection_string.database() == Some(name) {
            debug!(database = name, "Already on requested database");
            return Ok(());
        }

        let rewritten = self.connection_string.with_database(name)?;
        let fresh = self.open(&rewritten).await?;

        if let Some(previous) = self.conn.replace(fresh) {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Closing previous connection failed");
            }
        }
        self.connection_string = rewritten;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Closing context connection failed");
            }
        }
    }
}

// =============================================================================
// Tracking
// =============================================================================

/// Pending changes plus the identity map.
#[derive(Default)]
pub(crate) struct Tracking {
    pub(crate) changes: ChangeTracker,
    identities: HashMap<(&'static str, Value), Box<dyn Any + Send + Sync>>,
}

impl Tracking {
    pub(crate) fn identity<T: Entity>(&self, key: &Value) -> Option<T> {
        self.identities
            .get(&(T::TABLE, key.clone()))
            .and_then(|entity| entity.downcast_ref::<T>())
            .cloned()
    }

    pub(crate) fn remember<T: Entity>(&mut self, entity: &T) {
        let key = entity.key();
        if key.is_null() || (T::KEY_GENERATED && key.is_unset_key()) {
            return;
        }
        self.identities
            .insert((T::TABLE, key), Box::new(entity.clone()));
    }

    pub(crate) fn forget<T: Entity>(&mut self, key: &Value) {
        self.identities.remove(&(T::TABLE, key.clone()));
    }

    fn clear(&mut self) {
        self.changes.clear();
        self.identities.clear();
    }
}

// =============================================================================
// Context
// =============================================================================

/// The persistence context shared by one unit of work's repositories.
pub struct DbContext {
    session: AsyncMutex<Session>,
    tracking: Mutex<Tracking>,
    stats: Stats,
    disposed: AtomicBool,
}

impl std::fmt::Debug for DbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("stats", &self.stats.snapshot())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl DbContext {
    pub(crate) fn new(config: &DbConfig, schema: SchemaPlan) -> Self {
        DbContext {
            session: AsyncMutex::new(Session {
                connection_string: config.connection(),
                busy_timeout: config.busy_timeout_duration(),
                ensure_schema: config.ensure_schema,
                schema,
                conn: None,
            }),
            tracking: Mutex::new(Tracking::default()),
            stats: Stats::default(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.stats.snapshot()
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the connection has been opened.
    pub async fn is_open(&self) -> bool {
        self.session.lock().await.conn.is_some()
    }

    pub async fn connection_string(&self) -> String {
        self.session.lock().await.connection_string.to_string()
    }

    /// The `Database` name the context currently targets.
    pub async fn database(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .connection_string
            .database()
            .map(str::to_string)
    }

    pub fn has_changes(&self) -> DbResult<bool> {
        self.with_tracking(|t| t.changes.has_changes())
    }

    pub fn pending_count(&self) -> DbResult<usize> {
        self.with_tracking(|t| t.changes.len())
    }

    /// Tracked state of the `T` with `key`.
    pub fn state_of<T: Entity>(&self, key: impl Into<Value>) -> DbResult<EntityState> {
        let key = key.into();
        self.with_tracking(|t| t.changes.state_of(T::TABLE, &key))
    }

    pub(crate) fn check_live(&self) -> DbResult<()> {
        if self.is_disposed() {
            return Err(DbError::Disposed);
        }
        Ok(())
    }

    pub(crate) async fn session(&self) -> DbResult<MutexGuard<'_, Session>> {
        self.check_live()?;
        Ok(self.session.lock().await)
    }

    /// Runs `f` with the tracker locked. The lock is released before
    /// returning, so callers never hold it across an await.
    pub(crate) fn with_tracking<R>(&self, f: impl FnOnce(&mut Tracking) -> R) -> DbResult<R> {
        self.check_live()?;
        let mut tracking = self
            .tracking
            .lock()
            .map_err(|_| DbError::Internal("change tracker lock poisoned".to_string()))?;
        Ok(f(&mut tracking))
    }

    /// Runs one raw statement outside any explicit transaction.
    pub(crate) async fn execute_raw(&self, stmt: &Statement) -> DbResult<u64> {
        let mut session = self.session().await?;
        let conn = session.connection().await?;
        execute(conn, stmt, &self.stats).await
    }

    /// Runs bulk statements in one transaction, each bounded by `batch_timeout`.
    pub(crate) async fn execute_batches(
        &self,
        statements: &[Statement],
        batch_timeout: Duration,
    ) -> DbResult<u64> {
        let mut session = self.session().await?;
        let conn = session.connection().await?;
        let mut tx = conn.begin().await?;
        defer_foreign_keys(&mut tx).await?;

        let mut rows = 0;
        for (batch, stmt) in statements.iter().enumerate() {
            let written = tokio::time::timeout(batch_timeout, execute(&mut *tx, stmt, &self.stats))
                .await
                .map_err(|_| DbError::Timeout {
                    operation: format!("bulk insert batch {}", batch + 1),
                    millis: u64::try_from(batch_timeout.as_millis()).unwrap_or(u64::MAX),
                })??;
            debug!(batch = batch + 1, rows = written, "Bulk batch written");
            rows += written;
        }

        tx.commit().await?;
        Ok(rows)
    }

    /// Retargets the context at database `name`; the identity map is
    /// dropped, pending changes stay queued.
    pub(crate) async fn switch_database(&self, name: &str) -> DbResult<()> {
        let mut session = self.session().await?;
        session.switch(name).await?;
        drop(session);
        self.with_tracking(|t| t.identities.clear())
    }

    /// Schema (total, applied) as seen by the current connection.
    pub(crate) async fn schema_status(&self) -> DbResult<(usize, usize)> {
        let mut session = self.session().await?;
        let plan = session.schema;
        let conn = session.connection().await?;
        schema::status(conn, &plan).await
    }

    /// Marks the context disposed, drops pending state and closes the
    /// connection. Returns false when already released.
    pub(crate) async fn release(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        match self.tracking.lock() {
            Ok(mut tracking) => tracking.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        self.session.lock().await.close().await;
        true
    }
}

// =============================================================================
// Saving
// =============================================================================

async fn flush(conn: &mut SqliteConnection, entries: &[Entry], stats: &Stats) -> DbResult<u64> {
    let mut rows = 0;
    for entry in entries {
        if let Some(stmt) = entry.statement() {
            rows += execute(&mut *conn, &stmt, stats).await?;
        }
    }
    Ok(rows)
}

/// Begins a transaction per session, flushes each in order, then commits
/// each. On error, returns how many participants had already committed.
async fn flush_and_commit(
    contexts: &[&DbContext],
    sessions: &mut [MutexGuard<'_, Session>],
    drained: &[Vec<Entry>],
) -> Result<u64, (usize, DbError)> {
    let mut transactions = Vec::with_capacity(sessions.len());
    let mut checks = Vec::with_capacity(sessions.len());
    for session in sessions.iter_mut() {
        checks.push(session.foreign_keys());
        let conn = session.connection().await.map_err(|e| (0, e))?;
        let mut tx = conn.begin().await.map_err(|e| (0, DbError::from(e)))?;
        defer_foreign_keys(&mut tx).await.map_err(|e| (0, e))?;
        transactions.push(tx);
    }

    // A lone participant is atomic at its own COMMIT; peers are checked
    // before the first COMMIT so a violation rolls every one back.
    let check_before_commit = transactions.len() > 1;

    let mut rows = 0;
    let mut failure = None;
    for (index, tx) in transactions.iter_mut().enumerate() {
        let flushed = match flush(&mut **tx, &drained[index], contexts[index].stats()).await {
            Ok(n) if check_before_commit && checks[index] => {
                check_foreign_keys(&mut **tx).await.map(|()| n)
            }
            other => other,
        };
        match flushed {
            Ok(n) => rows += n,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if let Some(e) = failure {
        for tx in transactions {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
        }
        return Err((0, e));
    }

    let mut committed = 0;
    for tx in transactions {
        tx.commit().await.map_err(|e| {
            // Deferred constraint failures surface here; nothing has
            // committed yet for the first participant.
            let err = if committed == 0 {
                DbError::from(e)
            } else {
                DbError::TransactionFailed(format!(
                    "commit of participant {} failed: {}",
                    committed + 1,
                    e
                ))
            };
            (committed, err)
        })?;
        committed += 1;
    }

    Ok(rows)
}

/// Saves every context's pending changes as one logical commit.
///
/// ## Returns
/// * `Ok(rows)` - Total rows affected
/// * `Err(DbError)` - First failure; uncommitted participants keep their
///   pending changes
pub(crate) async fn save_together(contexts: &[&DbContext]) -> DbResult<u64> {
    let mut sessions = Vec::with_capacity(contexts.len());
    for context in contexts {
        sessions.push(context.session().await?);
    }

    let mut drained = Vec::with_capacity(contexts.len());
    for context in contexts {
        match context.with_tracking(|t| t.changes.drain()) {
            Ok(entries) => drained.push(entries),
            Err(e) => {
                for (context, entries) in contexts.iter().zip(drained) {
                    if let Err(restore) = restore_pending(context, entries) {
                        warn!(error = %restore, "Could not restore pending changes");
                    }
                }
                return Err(e);
            }
        }
    }

    let pending: usize = drained.iter().map(Vec::len).sum();
    debug!(participants = contexts.len(), pending, "Saving changes");

    match flush_and_commit(contexts, &mut sessions, &drained).await {
        Ok(rows) => {
            debug!(participants = contexts.len(), rows, "Changes saved");
            Ok(rows)
        }
        Err((committed, e)) => {
            warn!(
                participants = contexts.len(),
                committed,
                error = %e,
                "Save failed, pending changes restored"
            );
            for (context, entries) in contexts.iter().zip(drained).skip(committed) {
                restore_pending(context, entries)?;
            }
            Err(e)
        }
    }
}

/// Requeues drained entries, logging newer changes that lost to them.
fn restore_pending(context: &DbContext, entries: Vec<Entry>) -> DbResult<()> {
    let conflicts = context.with_tracking(|t| t.changes.restore(entries))?;
    for conflict in &conflicts {
        warn!(error = %conflict, "Change queued during save was dropped");
    }
    Ok(())
}
