//! # Model Module
//!
//! Class-level operations of a model, available on `Arc<ModelSchema>`, and the
//! [`Model`] trait that maps a Rust struct onto a schema.
//!
//! The trait is normally implemented with `#[derive(Model)]`:
//!
//! ```rust,ignore
//! use keel_orm::Model;
//!
//! #[derive(Debug, Model)]
//! #[orm(has_many(name = "courses", model = "Course", foreign_key = "user_id"))]
//! struct User {
//!     #[orm(primary_key, auto_increment)]
//!     id: Option<i32>,
//!     #[orm(size = 50, unique)]
//!     username: String,
//!     email: Option<String>,
//! }
//!
//! let user = User { id: None, username: "ann".into(), email: None }.create(&db).await?;
//! let found = User::find_by_id(&db, user.id).await?;
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use async_trait::async_trait;
use log::info;
use std::sync::Arc;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::Connection,
    query_builder::QueryBuilder,
    record::Record,
    schema::{self, ModelSchema},
    value::{Row, Value},
    Error, Result,
};

// ============================================================================
// Class-level operations
// ============================================================================

impl ModelSchema {
    /// A SELECT over this model's table.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(self.table())
    }

    /// A query filtered by equality on every `(field, value)` pair. Fields
    /// must be declared on the model.
    pub fn query_where(&self, criteria: &[(&str, Value)]) -> Result<QueryBuilder> {
        criteria.iter().try_fold(self.query(), |query, (field, value)| {
            if !self.has_field(field) {
                return Err(Error::query(format!("{} has no field `{field}`", self.name())));
            }
            Ok(query.where_eq(*field, value.clone()))
        })
    }

    pub fn new_record<I, K, V>(self: &Arc<Self>, values: I) -> Record
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Record::new(self.clone(), values)
    }

    /// A persisted record from a row returned by the server.
    pub fn hydrate(self: &Arc<Self>, row: Row) -> Record {
        Record::from_row(self.clone(), row)
    }

    fn hydrate_all(self: &Arc<Self>, rows: Vec<Row>) -> Vec<Record> {
        rows.into_iter().map(|row| self.hydrate(row)).collect()
    }

    /// Looks a record up by primary key. The key is converted to the
    /// primary-key column type first.
    pub async fn find_by_id<C: Connection + ?Sized>(self: &Arc<Self>, conn: &C, id: impl Into<Value>) -> Result<Option<Record>> {
        let pk = self.primary_key();
        let id = pk.field_type.coerce(id.into())?;
        let row = self.query().where_eq(&pk.name, id).first(conn).await?;
        Ok(row.map(|row| self.hydrate(row)))
    }

    /// The first record matching `criteria`.
    pub async fn get<C: Connection + ?Sized>(self: &Arc<Self>, conn: &C, criteria: &[(&str, Value)]) -> Result<Option<Record>> {
        let row = self.query_where(criteria)?.first(conn).await?;
        Ok(row.map(|row| self.hydrate(row)))
    }

    pub async fn filter<C: Connection + ?Sized>(self: &Arc<Self>, conn: &C, criteria: &[(&str, Value)]) -> Result<Vec<Record>> {
        let rows = self.query_where(criteria)?.fetch_all(conn).await?;
        Ok(self.hydrate_all(rows))
    }

    pub async fn all<C: Connection + ?Sized>(self: &Arc<Self>, conn: &C) -> Result<Vec<Record>> {
        let rows = self.query().fetch_all(conn).await?;
        Ok(self.hydrate_all(rows))
    }

    pub async fn exists<C: Connection + ?Sized>(&self, conn: &C, criteria: &[(&str, Value)]) -> Result<bool> {
        self.query_where(criteria)?.exists(conn).await
    }

    pub async fn count<C: Connection + ?Sized>(&self, conn: &C) -> Result<i64> {
        self.query().count(conn).await
    }

    pub async fn count_where<C: Connection + ?Sized>(&self, conn: &C, criteria: &[(&str, Value)]) -> Result<i64> {
        self.query_where(criteria)?.count(conn).await
    }

    /// Deletes every row matching `criteria` and returns how many went.
    ///
    /// **Empty criteria delete the whole table.**
    pub async fn delete_where<C: Connection + ?Sized>(&self, conn: &C, criteria: &[(&str, Value)]) -> Result<u64> {
        self.query_where(criteria)?.delete(conn).await
    }

    /// Creates the table (if missing) and its declared indexes.
    pub async fn create_table<C: Connection + ?Sized>(&self, conn: &C) -> Result<()> {
        conn.execute(&self.create_table_sql(), &[]).await?;
        for index in self.index_sql() {
            conn.execute(&index, &[]).await?;
        }
        info!("table {} is ready", self.table());
        Ok(())
    }

    pub async fn drop_table<C: Connection + ?Sized>(&self, conn: &C) -> Result<()> {
        conn.execute(&self.drop_table_sql(), &[]).await?;
        info!("table {} dropped", self.table());
        Ok(())
    }

    /// `CREATE TABLE` for the join table of the many-to-many relationship
    /// `name`; `None` for any other kind.
    pub fn through_table_sql(&self, name: &str) -> Result<Option<String>> {
        let relationship = self.relationship(name)?;
        let related = schema::lookup(&relationship.related_model)?;
        Ok(relationship.through_table_sql(self, &related))
    }
}

// ============================================================================
// Model Trait
// ============================================================================

/// A Rust type stored as rows of a [`ModelSchema`].
///
/// Implementations provide the schema and the conversions to and from a
/// [`Record`]; the lookups and [`create`](Model::create) come for free.
#[async_trait]
pub trait Model: Sized + Send + Sync + 'static {
    /// The model's schema, built once and registered by model name.
    fn schema() -> Arc<ModelSchema>;

    fn from_record(record: &Record) -> Result<Self>;

    /// Every declared field with its current value, in declaration order.
    fn to_values(&self) -> Result<Vec<(&'static str, Value)>>;

    /// A transient record holding this value's fields. `None` fields are
    /// left out so field defaults apply.
    fn to_record(&self) -> Result<Record> {
        let values = self.to_values()?.into_iter().filter(|(_, value)| !value.is_null());
        Ok(Record::new(Self::schema(), values))
    }

    /// Inserts this value and returns it as stored (generated keys and
    /// server defaults filled in).
    async fn create<C: Connection + ?Sized>(&self, conn: &C) -> Result<Self> {
        let mut record = self.to_record()?;
        record.save(conn).await?;
        Self::from_record(&record)
    }

    async fn find_by_id<C, V>(conn: &C, id: V) -> Result<Option<Self>>
    where
        C: Connection + ?Sized,
        V: Into<Value> + Send,
    {
        let id = id.into();
        match Self::schema().find_by_id(conn, id).await? {
            Some(record) => Self::from_record(&record).map(Some),
            None => Ok(None),
        }
    }

    async fn get<C: Connection + ?Sized>(conn: &C, criteria: &[(&str, Value)]) -> Result<Option<Self>> {
        match Self::schema().get(conn, criteria).await? {
            Some(record) => Self::from_record(&record).map(Some),
            None => Ok(None),
        }
    }

    async fn filter<C: Connection + ?Sized>(conn: &C, criteria: &[(&str, Value)]) -> Result<Vec<Self>> {
        Self::schema().filter(conn, criteria).await?.iter().map(Self::from_record).collect()
    }

    async fn all<C: Connection + ?Sized>(conn: &C) -> Result<Vec<Self>> {
        Self::schema().all(conn).await?.iter().map(Self::from_record).collect()
    }

    async fn count<C: Connection + ?Sized>(conn: &C) -> Result<i64> {
        Self::schema().count(conn).await
    }

    async fn exists<C: Connection + ?Sized>(conn: &C, criteria: &[(&str, Value)]) -> Result<bool> {
        Self::schema().exists(conn, criteria).await
    }
}
