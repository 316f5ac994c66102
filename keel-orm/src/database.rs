//! # Database Module
//!
//! This module provides the connection pool and the driver seam of Keel ORM.
//!
//! - [`Database`] owns a PostgreSQL pool, counts executed statements and
//!   connection failures, and is cheap to clone and share across tasks.
//! - [`Connection`] is the seam every SQL-issuing operation goes through. It is
//!   implemented by the pool itself, by a scoped [`PooledConnection`] and by a
//!   [`Transaction`], so the same record or query code runs in all three.
//! - [`RawQuery`] sends hand-written SQL with positional parameters.

// ============================================================================
// External Crate Imports
// ============================================================================

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use serde::Serialize;
use sqlx::{
    pool::PoolConnection,
    postgres::{PgConnectOptions, PgPool, PgPoolOptions},
    Postgres,
};
use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    codec,
    config::{encode_dsn, PoolConfig},
    migration::Migrator,
    transaction::Transaction,
    value::{Row, Value},
    Error, Result,
};

// ============================================================================
// Connection Trait
// ============================================================================

/// Something SQL can be sent to.
///
/// Every operation in the crate that touches the server is generic over
/// `C: Connection + ?Sized`, so callers decide whether a statement runs on
/// any pooled connection (`&Database`), on one they hold (`&PooledConnection`)
/// or inside a transaction (`&Transaction`).
pub trait Connection: Send + Sync {
    /// Executes a statement and returns the number of affected rows.
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<u64>>;

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Row>>>;

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Row>>>;

    /// Returns the first column of the first row, if any.
    fn fetch_scalar<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move { Ok(self.fetch_optional(sql, params).await?.and_then(Row::into_first)) })
    }
}

impl<C: Connection + ?Sized> Connection for &C {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<u64>> {
        (**self).execute(sql, params)
    }

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Row>>> {
        (**self).fetch_all(sql, params)
    }

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Row>>> {
        (**self).fetch_optional(sql, params)
    }
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Shared counters, updated by every handle derived from one pool.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    queries_executed: AtomicU64,
    connection_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn record_query(&self, sql: &str, params: &[Value]) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        debug!("executing: {sql} ({} params)", params.len());
    }

    /// Passes a driver result through, counting connection-level failures.
    pub(crate) fn track<T>(&self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|err| {
            let err = Error::from(err);
            if err.is_connection() {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
            }
            err
        })
    }
}

/// A snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_connections: u32,
    pub active_connections: u32,
    pub idle_connections: u32,
    pub queries_executed: u64,
    pub connection_errors: u64,
    pub closed: bool,
}

// ============================================================================
// Database Struct
// ============================================================================

/// The main entry point for Keel ORM database operations.
///
/// `Database` manages a connection pool and provides methods for acquiring
/// connections, starting transactions, creating tables and running raw SQL.
/// Clones share the same pool and counters.
#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) pool: PgPool,
    pub(crate) counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
}

// ============================================================================
// Database Implementation
// ============================================================================

impl Database {
    /// Creates a new DatabaseBuilder for configuring the connection.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Connects using default pool settings.
    pub async fn connect(dsn: &str) -> Result<Self> {
        DatabaseBuilder::new().connect(dsn).await
    }

    /// Connects using an explicit [`PoolConfig`].
    pub async fn from_config(config: PoolConfig) -> Result<Self> {
        DatabaseBuilder { config }.build().await
    }

    /// Connects using [`PoolConfig::from_env`].
    pub async fn from_env() -> Result<Self> {
        Self::from_config(PoolConfig::from_env()?).await
    }

    /// Returns a new Migrator instance for table creation and the migration ledger.
    pub fn migrator(&self) -> Migrator<'_> {
        Migrator::new(self)
    }

    /// Creates a raw SQL query builder.
    pub fn raw<'a>(&'a self, sql: &'a str) -> RawQuery<'a, Self> {
        RawQuery::new(self, sql)
    }

    /// Checks a connection out of the pool.
    ///
    /// The connection goes back to the pool when the returned guard is
    /// dropped. When the pool is saturated this waits until a connection is
    /// released or the acquire timeout elapses.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let conn = self.counters.track(self.pool.acquire().await)?;
        Ok(PooledConnection {
            conn: tokio::sync::Mutex::new(Some(conn)),
            counters: self.counters.clone(),
            open_transaction: AtomicBool::new(false),
        })
    }

    /// Starts a new database transaction pinned to one pooled connection.
    pub async fn begin(&self) -> Result<Transaction> {
        let tx = self.counters.track(self.pool.begin().await)?;
        self.counters.record_query("BEGIN", &[]);
        Ok(Transaction::new(tx, self.counters.clone()))
    }

    /// Runs `callback` inside a transaction.
    ///
    /// The transaction is committed when the callback returns `Ok` and rolled
    /// back when it returns `Err`; the callback's error is returned unchanged.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let id = db
    ///     .transaction(|tx| Box::pin(async move {
    ///         let mut account = accounts.new_record([("name", "A")]);
    ///         account.save(tx).await?;
    ///         Ok(account.pk_value())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<F, R>(&self, callback: F) -> Result<R>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<R>> + Send,
        R: Send,
    {
        let tx = self.begin().await?;
        match callback(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if tx.is_active().await {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!("rollback after a failed transaction body also failed: {rollback_err}");
                    }
                }
                Err(err)
            }
        }
    }

    /// A snapshot of the pool's connection counts and statement counters.
    pub fn stats(&self) -> PoolStats {
        let total = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX).min(total);
        PoolStats {
            total_connections: total,
            active_connections: total - idle,
            idle_connections: idle,
            queries_executed: self.counters.queries_executed.load(Ordering::Relaxed),
            connection_errors: self.counters.connection_errors.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    /// Runs `SELECT 1`. Failures are logged and counted, never raised.
    pub async fn health_check(&self) -> bool {
        match self.fetch_scalar("SELECT 1", &[]).await {
            Ok(Some(Value::Int(1))) => true,
            Ok(other) => {
                error!("health check returned an unexpected value: {other:?}");
                self.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(err) => {
                error!("health check failed: {err}");
                if !err.is_connection() {
                    self.counters.connection_errors.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }
    }

    /// The server's version string together with the current pool stats.
    pub async fn server_info(&self) -> Result<(String, PoolStats)> {
        let version = self.fetch_scalar("SELECT version()", &[]).await?;
        let version = version.map(|v| v.to_string()).unwrap_or_default();
        Ok((version, self.stats()))
    }

    /// Closes every pooled connection. Calling it again does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
        info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.pool.is_closed()
    }

    /// Checks if a table exists in the `public` schema.
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let params = [Value::from(table)];
        let exists = self
            .fetch_scalar(
                "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name = $1 AND table_schema = 'public')",
                &params,
            )
            .await?;
        Ok(matches!(exists, Some(Value::Bool(true))))
    }

    /// Returns the column names of a table in ordinal order.
    pub async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let params = [Value::from(table)];
        let rows = self
            .fetch_all(
                "SELECT column_name::TEXT FROM information_schema.columns \
                 WHERE table_name = $1 AND table_schema = 'public' ORDER BY ordinal_position",
                &params,
            )
            .await?;
        rows.iter().map(|row| row.try_get::<String>("column_name")).collect()
    }
}

impl Connection for Database {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            self.counters.record_query(sql, params);
            let done = self.counters.track(codec::prepare(sql, params).execute(&self.pool).await)?;
            Ok(done.rows_affected())
        })
    }

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move {
            self.counters.record_query(sql, params);
            let rows = self.counters.track(codec::prepare(sql, params).fetch_all(&self.pool).await)?;
            rows.iter().map(codec::decode_row).collect()
        })
    }

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(async move {
            self.counters.record_query(sql, params);
            let row = self.counters.track(codec::prepare(sql, params).fetch_optional(&self.pool).await)?;
            row.as_ref().map(codec::decode_row).transpose()
        })
    }
}

// ============================================================================
// DatabaseBuilder Struct
// ============================================================================

/// Fluent pool configuration, mirroring [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    config: PoolConfig,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self { config: PoolConfig::new(String::new()) }
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.config.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Server-side statement timeout. `Duration::ZERO` disables it.
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.config.statement_timeout_secs = timeout.as_secs();
        self
    }

    pub async fn connect(mut self, dsn: &str) -> Result<Database> {
        self.config.dsn = dsn.to_string();
        self.build().await
    }

    async fn build(self) -> Result<Database> {
        let config = self.config;
        config.validate()?;

        let dsn = encode_dsn(&config.dsn)?;
        let mut options = PgConnectOptions::from_str(&dsn).map_err(|e| Error::Connection {
            message: format!("invalid DSN: {e}"),
            source: Some(e),
        })?;
        if let Some(timeout) = config.statement_timeout() {
            options = options.options([("statement_timeout", format!("{}s", timeout.as_secs()))]);
        }

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .connect_with(options)
            .await
            .map_err(|e| Error::Connection { message: format!("cannot create the connection pool: {e}"), source: Some(e) })?;

        info!(
            "connection pool ready (min {}, max {} connections)",
            config.min_connections, config.max_connections
        );

        Ok(Database { pool, counters: Arc::new(Counters::default()), closed: Arc::new(AtomicBool::new(false)) })
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out of the pool for the lifetime of this guard.
///
/// Dropping the guard returns the connection to the pool. If a `BEGIN` sent
/// through [`Connection::execute`] was not matched by `COMMIT` or `ROLLBACK`,
/// the connection is closed instead so no other caller inherits the open
/// transaction.
pub struct PooledConnection {
    conn: tokio::sync::Mutex<Option<PoolConnection<Postgres>>>,
    counters: Arc<Counters>,
    open_transaction: AtomicBool,
}

impl PooledConnection {
    fn observe(&self, sql: &str) {
        let head = sql.trim_start().to_ascii_uppercase();
        if head.starts_with("BEGIN") || head.starts_with("START TRANSACTION") {
            self.open_transaction.store(true, Ordering::SeqCst);
        } else if head.starts_with("COMMIT")
            || head.starts_with("END")
            || (head.starts_with("ROLLBACK") && !head.starts_with("ROLLBACK TO"))
        {
            self.open_transaction.store(false, Ordering::SeqCst);
        }
    }

    fn released() -> Error {
        Error::connection("the pooled connection has already been released")
    }
}

impl Connection for PooledConnection {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(Self::released)?;
            self.counters.record_query(sql, params);
            let done = self.counters.track(codec::prepare(sql, params).execute(&mut **conn).await)?;
            self.observe(sql);
            Ok(done.rows_affected())
        })
    }

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(Self::released)?;
            self.counters.record_query(sql, params);
            let rows = self.counters.track(codec::prepare(sql, params).fetch_all(&mut **conn).await)?;
            rows.iter().map(codec::decode_row).collect()
        })
    }

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(async move {
            let mut guard = self.conn.lock().await;
            let conn = guard.as_mut().ok_or_else(Self::released)?;
            self.counters.record_query(sql, params);
            let row = self.counters.track(codec::prepare(sql, params).fetch_optional(&mut **conn).await)?;
            row.as_ref().map(codec::decode_row).transpose()
        })
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.open_transaction.load(Ordering::SeqCst) {
            return;
        }
        if let Some(conn) = self.conn.get_mut().take() {
            warn!("pooled connection released inside an open transaction; closing it instead of returning it");
            drop(conn.detach());
        }
    }
}

// ============================================================================
// Raw SQL Query Builder
// ============================================================================

/// Hand-written SQL with positional (`$n`) parameters.
///
/// # Example
///
/// ```rust,ignore
/// let rows = db.raw("SELECT id FROM accounts WHERE balance > $1").bind(100).fetch_all().await?;
/// ```
pub struct RawQuery<'a, C: ?Sized> {
    conn: &'a C,
    sql: &'a str,
    params: Vec<Value>,
}

impl<'a, C> RawQuery<'a, C>
where
    C: Connection + ?Sized,
{
    pub fn new(conn: &'a C, sql: &'a str) -> Self {
        Self { conn, sql, params: Vec::new() }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub async fn fetch_all(self) -> Result<Vec<Row>> {
        self.conn.fetch_all(self.sql, &self.params).await
    }

    /// Fetches exactly one row; no row is a query error.
    pub async fn fetch_one(self) -> Result<Row> {
        self.conn
            .fetch_optional(self.sql, &self.params)
            .await?
            .ok_or_else(|| Error::query("statement returned no rows"))
    }

    pub async fn fetch_optional(self) -> Result<Option<Row>> {
        self.conn.fetch_optional(self.sql, &self.params).await
    }

    pub async fn fetch_scalar(self) -> Result<Option<Value>> {
        self.conn.fetch_scalar(self.sql, &self.params).await
    }

    pub async fn execute(self) -> Result<u64> {
        self.conn.execute(self.sql, &self.params).await
    }
}
