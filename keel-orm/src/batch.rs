//! # Batch Module
//!
//! [`BatchOperation`] stages inserts, updates and deletes for one model and
//! sends them in as few statements as possible:
//!
//! - inserts become one multi-row `INSERT … RETURNING *` per chunk of
//!   `batch_size` rows;
//! - updates run one `UPDATE` per staged id;
//! - deletes become one `DELETE … WHERE pk IN (…)` per chunk.
//!
//! ```rust,ignore
//! let mut batch = BatchOperation::for_model::<Item>().batch_size(500);
//! for name in names {
//!     batch.add_insert([("name", name)]);
//! }
//! batch.add_delete(17);
//! let summary = batch.execute_all(&db).await?;
//! println!("{} inserted, {} deleted", summary.inserted.len(), summary.deleted_count);
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::{Connection, Database},
    model::Model,
    query_builder::QueryBuilder,
    record::Record,
    schema::ModelSchema,
    transaction::Transaction,
    value::Value,
    Error, Result,
};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Outcome of [`BatchOperation::execute_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    /// Inserted rows as stored, in staging order.
    pub inserted: Vec<Record>,
    /// Updated rows as stored. Ids that matched nothing are absent.
    pub updated: Vec<Record>,
    pub deleted_count: u64,
}

type Columns = Vec<(String, Value)>;

/// Staged write operations against one model's table.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    schema: Arc<ModelSchema>,
    batch_size: usize,
    inserts: Vec<Columns>,
    updates: Vec<(Value, Columns)>,
    deletes: Vec<Value>,
}

impl BatchOperation {
    pub fn new(schema: Arc<ModelSchema>) -> Self {
        Self { schema, batch_size: DEFAULT_BATCH_SIZE, inserts: Vec::new(), updates: Vec::new(), deletes: Vec::new() }
    }

    pub fn for_model<M: Model>() -> Self {
        Self::new(M::schema())
    }

    /// Rows per INSERT statement and ids per DELETE statement.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn add_insert<I, K, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.inserts.push(values.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Stages `patch` for the row whose primary key is `id`.
    pub fn add_update<I, K, V>(&mut self, id: impl Into<Value>, patch: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.updates.push((id.into(), patch.into_iter().map(|(k, v)| (k.into(), v.into())).collect()));
        self
    }

    pub fn add_delete(&mut self, id: impl Into<Value>) -> &mut Self {
        self.deletes.push(id.into());
        self
    }

    /// Number of staged operations.
    pub fn pending(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Sends the staged inserts and clears them.
    ///
    /// Each chunk is its own statement. When one fails, the chunks already
    /// written are unstaged and the failing chunk onwards stays staged.
    pub async fn execute_inserts<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<Vec<Record>> {
        let mut written = 0;
        let result = self.run_inserts(conn, &mut written).await;
        self.inserts.drain(..written);
        result
    }

    /// Sends the staged updates and clears them. Updates that ran before a
    /// failure are unstaged.
    pub async fn execute_updates<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<Vec<Record>> {
        let mut written = 0;
        let result = self.run_updates(conn, &mut written).await;
        self.updates.drain(..written);
        result
    }

    /// Sends the staged deletes, clears them, and returns the rows removed.
    /// Chunks that ran before a failure are unstaged.
    pub async fn execute_deletes<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<u64> {
        let mut written = 0;
        let result = self.run_deletes(conn, &mut written).await;
        self.deletes.drain(..written);
        result
    }

    /// Runs inserts, then updates, then deletes in one transaction.
    ///
    /// Staged operations are cleared only once the transaction commits; on
    /// failure everything is rolled back and stays staged.
    pub async fn execute_all(&mut self, db: &Database) -> Result<BatchSummary> {
        let tx = db.begin().await?;
        let summary = match self.run_all(&tx).await {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("rollback of batch on {} failed: {rollback_err}", self.schema.table());
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        self.clear();
        info!(
            "batch on {}: {} inserted, {} updated, {} deleted",
            self.schema.table(),
            summary.inserted.len(),
            summary.updated.len(),
            summary.deleted_count
        );
        Ok(summary)
    }

    /// Runs every staged operation inside `tx` under a savepoint. On failure
    /// the work done by the batch is undone, the rest of `tx` is kept usable
    /// and the operations stay staged.
    pub async fn execute_all_in(&mut self, tx: &Transaction) -> Result<BatchSummary> {
        let savepoint = tx.savepoint(None).await?;
        match self.run_all(tx).await {
            Ok(summary) => {
                tx.release_savepoint(&savepoint).await?;
                self.clear();
                Ok(summary)
            }
            Err(err) => {
                tx.rollback_to_savepoint(&savepoint).await?;
                tx.release_savepoint(&savepoint).await?;
                Err(err)
            }
        }
    }

    fn clear(&mut self) {
        self.inserts.clear();
        self.updates.clear();
        self.deletes.clear();
    }

    /// Staging is left alone; the callers clear it once the work is durable.
    async fn run_all<C: Connection + ?Sized>(&self, conn: &C) -> Result<BatchSummary> {
        Ok(BatchSummary {
            inserted: self.run_inserts(conn, &mut 0).await?,
            updated: self.run_updates(conn, &mut 0).await?,
            deleted_count: self.run_deletes(conn, &mut 0).await?,
        })
    }

    /// Converts staged columns to their column types. Undeclared columns are
    /// rejected.
    fn coerce(&self, columns: &Columns) -> Result<Columns> {
        columns
            .iter()
            .map(|(name, value)| {
                let field = self
                    .schema
                    .field(name)
                    .ok_or_else(|| Error::query(format!("{} has no field `{name}`", self.schema.name())))?;
                Ok((name.clone(), field.field_type.coerce(value.clone())?))
            })
            .collect()
    }

    /// `written` counts the staged rows whose statement succeeded.
    async fn run_inserts<C: Connection + ?Sized>(&self, conn: &C, written: &mut usize) -> Result<Vec<Record>> {
        let rows = self.inserts.iter().map(|columns| self.coerce(columns)).collect::<Result<Vec<_>>>()?;

        let mut inserted = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(self.batch_size) {
            let Some((sql, params)) = build_multi_insert(&self.schema, chunk) else {
                let sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING *", self.schema.table());
                for _ in chunk {
                    inserted.extend(conn.fetch_optional(&sql, &[]).await?.map(|row| self.schema.hydrate(row)));
                    *written += 1;
                }
                continue;
            };
            let stored = conn.fetch_all(&sql, &params).await?;
            *written += chunk.len();
            debug!("batch insert of {} rows into {}", chunk.len(), self.schema.table());
            inserted.extend(stored.into_iter().map(|row| self.schema.hydrate(row)));
        }
        Ok(inserted)
    }

    async fn run_updates<C: Connection + ?Sized>(&self, conn: &C, written: &mut usize) -> Result<Vec<Record>> {
        let pk = self.schema.primary_key();
        let mut updated = Vec::new();
        for (id, patch) in &self.updates {
            if patch.is_empty() {
                *written += 1;
                continue;
            }
            let id = pk.field_type.coerce(id.clone())?;
            let rows =
                QueryBuilder::new(self.schema.table()).values(self.coerce(patch)?).where_eq(&pk.name, id).update(conn).await?;
            updated.extend(rows.into_iter().map(|row| self.schema.hydrate(row)));
            *written += 1;
        }
        Ok(updated)
    }

    async fn run_deletes<C: Connection + ?Sized>(&self, conn: &C, written: &mut usize) -> Result<u64> {
        let pk = self.schema.primary_key();
        let mut deleted = 0;
        for chunk in self.deletes.chunks(self.batch_size) {
            let ids = chunk.iter().map(|id| pk.field_type.coerce(id.clone())).collect::<Result<Vec<_>>>()?;
            deleted += QueryBuilder::new(self.schema.table()).where_in(&pk.name, ids).delete(conn).await?;
            *written += chunk.len();
        }
        Ok(deleted)
    }
}

/// A multi-row INSERT over the union of the rows' columns, in declaration
/// order. Columns a row lacks are written as `DEFAULT`. `None` when no row
/// names any column.
fn build_multi_insert(schema: &ModelSchema, rows: &[Columns]) -> Option<(String, Vec<Value>)> {
    let columns: Vec<&str> = schema
        .fields()
        .iter()
        .map(|f| f.name.as_str())
        .filter(|name| rows.iter().any(|row| row.iter().any(|(column, _)| column == name)))
        .collect();
    if columns.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let slots: Vec<String> = columns
            .iter()
            .map(|column| match row.iter().rev().find(|(name, _)| name == column) {
                Some((_, value)) => {
                    params.push(value.clone());
                    format!("${}", params.len())
                }
                None => "DEFAULT".to_string(),
            })
            .collect();
        tuples.push(format!("({})", slots.join(", ")));
    }

    let sql = format!("INSERT INTO {} ({}) VALUES {} RETURNING *", schema.table(), columns.join(", "), tuples.join(", "));
    Some((sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        field::{Field, FieldType},
        testing::RecordingConnection,
    };
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;

    fn items() -> Arc<ModelSchema> {
        ModelSchema::builder("BatchTestItem")
            .field(Field::new("id", FieldType::Int).primary_key().auto_increment())
            .field(Field::new("name", FieldType::Text).not_null())
            .field(Field::new("price", FieldType::Decimal).default(0))
            .build()
            .unwrap()
    }

    fn item_row(id: i64, name: &str) -> Vec<(&'static str, Value)> {
        vec![("id", Value::Int(id)), ("name", Value::from(name)), ("price", Value::Decimal(Decimal::ZERO))]
    }

    #[tokio::test]
    async fn inserts_share_one_statement_and_fill_gaps_with_default() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![item_row(1, "a"), item_row(2, "b")]);

        let mut batch = BatchOperation::new(items());
        batch.add_insert([("name", Value::from("a")), ("price", Value::Int(3))]);
        batch.add_insert([("name", "b")]);
        let inserted = batch.execute_inserts(&conn).await?;

        let (sql, params) = &conn.statements()[0];
        assert_eq!(sql, "INSERT INTO batch_test_items (name, price) VALUES ($1, $2), ($3, DEFAULT) RETURNING *");
        assert_eq!(params, &vec![Value::from("a"), Value::Decimal(Decimal::from(3)), Value::from("b")]);
        assert_eq!(inserted.iter().map(Record::pk_value).collect::<Vec<_>>(), vec![Value::Int(1), Value::Int(2)]);
        assert!(inserted.iter().all(Record::exists));
        assert!(batch.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn inserts_are_chunked_by_batch_size() -> Result<()> {
        let conn = RecordingConnection::new();
        let mut batch = BatchOperation::new(items()).batch_size(2);
        for name in ["a", "b", "c"] {
            batch.add_insert([("name", name)]);
        }
        batch.execute_inserts(&conn).await?;

        assert_eq!(
            conn.sql(),
            vec![
                "INSERT INTO batch_test_items (name) VALUES ($1), ($2) RETURNING *",
                "INSERT INTO batch_test_items (name) VALUES ($1) RETURNING *",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn a_failed_chunk_keeps_itself_and_later_rows_staged() {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![item_row(1, "a"), item_row(2, "b")]);
        conn.push_error("value too long for type character varying(3)");

        let mut batch = BatchOperation::new(items()).batch_size(2);
        for name in ["a", "b", "c", "d", "e"] {
            batch.add_insert([("name", name)]);
        }

        assert!(batch.execute_inserts(&conn).await.is_err());
        assert_eq!(conn.statements().len(), 2);
        assert_eq!(batch.pending(), 3);

        // Retrying starts at the chunk that failed.
        conn.push_rows(vec![item_row(3, "c"), item_row(4, "d")]);
        conn.push_rows(vec![item_row(5, "e")]);
        let inserted = batch.execute_inserts(&conn).await.unwrap();
        assert_eq!(inserted.iter().map(Record::pk_value).collect::<Vec<_>>(), vec![Value::Int(3), Value::Int(4), Value::Int(5)]);
        assert_eq!(conn.statements()[2].1, vec![Value::from("c"), Value::from("d")]);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn a_failed_update_keeps_the_remaining_updates_staged() {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![item_row(1, "x")]);
        conn.push_error("deadlock detected");

        let mut batch = BatchOperation::new(items());
        batch.add_update(1, [("name", "x")]);
        batch.add_update(2, [("name", "y")]);
        batch.add_update(3, [("name", "z")]);

        assert!(batch.execute_updates(&conn).await.is_err());
        assert_eq!(batch.pending(), 2);
    }

    #[tokio::test]
    async fn deletes_sum_affected_rows_across_chunks() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_affected(2);
        conn.push_affected(0);

        let mut batch = BatchOperation::new(items()).batch_size(2);
        batch.add_delete(1).add_delete(2).add_delete(99);
        assert_eq!(batch.pending(), 3);

        assert_eq!(batch.execute_deletes(&conn).await?, 2);
        assert_eq!(
            conn.sql(),
            vec!["DELETE FROM batch_test_items WHERE id IN ($1, $2)", "DELETE FROM batch_test_items WHERE id IN ($1)"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn updates_skip_empty_patches_and_missing_rows() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![]);
        conn.push_rows(vec![item_row(5, "renamed")]);

        let mut batch = BatchOperation::new(items());
        batch.add_update(4, [("name", "gone")]);
        batch.add_update(6, Vec::<(&str, Value)>::new());
        batch.add_update(5, [("name", "renamed")]);
        let updated = batch.execute_updates(&conn).await?;

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].pk_value(), Value::Int(5));
        assert_eq!(
            conn.sql(),
            vec![
                "UPDATE batch_test_items SET name = $1 WHERE id = $2 RETURNING *",
                "UPDATE batch_test_items SET name = $1 WHERE id = $2 RETURNING *",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_columns_fail_before_anything_is_sent() {
        let conn = RecordingConnection::new();
        let mut batch = BatchOperation::new(items());
        batch.add_insert([("colour", "red")]);

        assert!(matches!(batch.execute_inserts(&conn).await, Err(Error::Query { .. })));
        assert!(conn.statements().is_empty());
        assert_eq!(batch.pending(), 1);
    }

    #[tokio::test]
    async fn rows_without_columns_use_default_values() -> Result<()> {
        let conn = RecordingConnection::new();
        let mut batch = BatchOperation::new(items());
        batch.add_insert(Vec::<(&str, Value)>::new());
        batch.execute_inserts(&conn).await?;
        assert_eq!(conn.sql(), vec!["INSERT INTO batch_test_items DEFAULT VALUES RETURNING *"]);
        Ok(())
    }
}
