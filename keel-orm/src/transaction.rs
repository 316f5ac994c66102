//! # Transaction Module
//!
//! A [`Transaction`] pins one pooled connection from `BEGIN` until it is
//! committed or rolled back. Pass `&tx` wherever a [`Connection`] is expected
//! and the statement joins the transaction.
//!
//! Savepoints are tracked in creation order. Rolling back to a savepoint keeps
//! it and discards every savepoint created after it; releasing a savepoint
//! drops it and every later one, matching the server's own bookkeeping.
//!
//! A failed statement does not roll anything back by itself. PostgreSQL
//! refuses further statements until the caller issues [`Transaction::rollback`]
//! or [`Transaction::rollback_to_savepoint`].

use futures::future::BoxFuture;
use log::debug;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{
    codec,
    database::{Connection, Counters},
    value::{Row, Value},
    Error, Result,
};

type PgTransaction = sqlx::Transaction<'static, sqlx::Postgres>;

// ============================================================================
// Savepoint Stack
// ============================================================================

/// Ordered savepoint names of one transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SavepointStack {
    names: Vec<String>,
}

impl SavepointStack {
    /// Name used when the caller does not supply one: `sp_1`, `sp_2`, …
    pub(crate) fn next_name(&self) -> String {
        format!("sp_{}", self.names.len() + 1)
    }

    pub(crate) fn push(&mut self, name: String) {
        self.names.push(name);
    }

    /// Position of the most recent savepoint called `name`.
    pub(crate) fn position(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .rposition(|n| n == name)
            .ok_or_else(|| Error::query(format!("unknown savepoint `{name}`")))
    }

    /// Keeps the savepoint at `idx`, forgets the ones created after it.
    pub(crate) fn rolled_back_to(&mut self, idx: usize) {
        self.names.truncate(idx + 1);
    }

    /// Forgets the savepoint at `idx` and the ones created after it.
    pub(crate) fn released(&mut self, idx: usize) {
        self.names.truncate(idx);
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }
}

fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 63 {
        Ok(())
    } else {
        Err(Error::query(format!("`{name}` is not a valid savepoint name")))
    }
}

// ============================================================================
// Transaction Struct
// ============================================================================

struct State {
    tx: Option<PgTransaction>,
    savepoints: SavepointStack,
}

/// A database transaction pinned to one connection.
///
/// Dropping an active transaction rolls it back before its connection
/// returns to the pool.
pub struct Transaction {
    state: Mutex<State>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

fn inactive() -> Error {
    Error::transaction_state("no active transaction")
}

impl Transaction {
    pub(crate) fn new(tx: PgTransaction, counters: Arc<Counters>) -> Self {
        Self { state: Mutex::new(State { tx: Some(tx), savepoints: SavepointStack::default() }), counters }
    }

    /// Whether the transaction can still accept statements.
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.tx.is_some()
    }

    /// Commits the transaction, persisting every change made through it.
    pub async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let tx = state.tx.take().ok_or_else(inactive)?;
        state.savepoints = SavepointStack::default();
        self.counters.record_query("COMMIT", &[]);
        self.counters.track(tx.commit().await)
    }

    /// Rolls the transaction back, discarding every change made through it.
    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let tx = state.tx.take().ok_or_else(inactive)?;
        state.savepoints = SavepointStack::default();
        self.counters.record_query("ROLLBACK", &[]);
        self.counters.track(tx.rollback().await)
    }

    /// Creates a savepoint and returns its name.
    ///
    /// Without a name one is generated from the current depth (`sp_1`,
    /// `sp_2`, …). Names must be plain SQL identifiers.
    pub async fn savepoint(&self, name: Option<&str>) -> Result<String> {
        let mut state = self.state.lock().await;
        let name = match name {
            Some(name) => name.to_string(),
            None => state.savepoints.next_name(),
        };
        check_identifier(&name)?;

        let sql = format!("SAVEPOINT {name}");
        self.run(&mut state, &sql).await?;
        state.savepoints.push(name.clone());
        debug!("savepoint {name} created");
        Ok(name)
    }

    /// Undoes everything done since `name` was created. The savepoint stays
    /// usable; savepoints created after it are gone.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tx.is_none() {
            return Err(inactive());
        }
        let idx = state.savepoints.position(name)?;

        self.run(&mut state, &format!("ROLLBACK TO SAVEPOINT {name}")).await?;
        state.savepoints.rolled_back_to(idx);
        Ok(())
    }

    /// Releases `name`, keeping its changes as part of the transaction.
    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tx.is_none() {
            return Err(inactive());
        }
        let idx = state.savepoints.position(name)?;

        self.run(&mut state, &format!("RELEASE SAVEPOINT {name}")).await?;
        state.savepoints.released(idx);
        Ok(())
    }

    /// Live savepoint names, oldest first.
    pub async fn savepoints(&self) -> Vec<String> {
        self.state.lock().await.savepoints.names().to_vec()
    }

    async fn run(&self, state: &mut State, sql: &str) -> Result<()> {
        let tx = state.tx.as_mut().ok_or_else(inactive)?;
        self.counters.record_query(sql, &[]);
        self.counters.track(sqlx::query(sql).execute(&mut **tx).await)?;
        Ok(())
    }
}

impl Connection for Transaction {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let tx = state.tx.as_mut().ok_or_else(inactive)?;
            self.counters.record_query(sql, params);
            let done = self.counters.track(codec::prepare(sql, params).execute(&mut **tx).await)?;
            Ok(done.rows_affected())
        })
    }

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let tx = state.tx.as_mut().ok_or_else(inactive)?;
            self.counters.record_query(sql, params);
            let rows = self.counters.track(codec::prepare(sql, params).fetch_all(&mut **tx).await)?;
            rows.iter().map(codec::decode_row).collect()
        })
    }

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let tx = state.tx.as_mut().ok_or_else(inactive)?;
            self.counters.record_query(sql, params);
            let row = self.counters.track(codec::prepare(sql, params).fetch_optional(&mut **tx).await)?;
            row.as_ref().map(codec::decode_row).transpose()
        })
    }
}
