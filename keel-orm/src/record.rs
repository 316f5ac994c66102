//! # Record Module
//!
//! [`Record`] is one row of a model held in memory: an active record that
//! knows its schema, whether it has been persisted, and which declared fields
//! changed since it was last loaded or saved.
//!
//! Only declared fields are tracked and persisted. Any other attribute set on
//! a record, or any extra column returned by a query, is kept alongside as a
//! plain attribute and never written back.

// ============================================================================
// External Crate Imports
// ============================================================================

use log::debug;
use serde::{de::DeserializeOwned, Serialize, Serializer};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::Connection,
    field::{DefaultValue, Field, FieldType},
    query_builder::QueryBuilder,
    relationship::RelatedManager,
    schema::{self, ModelSchema},
    value::{FromValue, Row, Value},
    Error, Result,
};

// ============================================================================
// Record Struct
// ============================================================================

/// An instance of a model.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<ModelSchema>,
    values: HashMap<String, Value>,
    persisted: HashMap<String, Value>,
    dirty: HashSet<String>,
    extras: BTreeMap<String, Value>,
    exists: bool,
    related_schemas: HashMap<String, Arc<ModelSchema>>,
}

impl Record {
    /// A transient record. Every declared field takes the supplied value,
    /// else its default (generators are invoked now), else `Null`.
    pub fn new<I, K, V>(schema: Arc<ModelSchema>, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut supplied: HashMap<String, Value> = values.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let mut record = Self::empty(schema.clone());

        for field in schema.fields() {
            let value = match supplied.remove(&field.name) {
                Some(value) => value,
                None => field.default.as_ref().map(DefaultValue::produce).unwrap_or(Value::Null),
            };
            record.values.insert(field.name.clone(), coerce_lenient(field, value));
        }
        record.extras.extend(supplied);
        record
    }

    /// A persisted record built from a row returned by the server.
    pub fn from_row(schema: Arc<ModelSchema>, row: Row) -> Self {
        let mut record = Self::empty(schema.clone());
        for field in schema.fields() {
            record.values.insert(field.name.clone(), Value::Null);
        }
        record.hydrate(row);
        record
    }

    fn empty(schema: Arc<ModelSchema>) -> Self {
        Self {
            schema,
            values: HashMap::new(),
            persisted: HashMap::new(),
            dirty: HashSet::new(),
            extras: BTreeMap::new(),
            exists: false,
            related_schemas: HashMap::new(),
        }
    }

    /// Replaces the stored state with `row`. JSON fields that arrive as text
    /// are parsed; undeclared columns become plain attributes.
    fn hydrate(&mut self, row: Row) {
        for (column, value) in row {
            match self.schema.field(&column) {
                Some(field) => {
                    let value = match (field.field_type, value) {
                        (FieldType::Json, Value::Text(text)) => match serde_json::from_str(&text) {
                            Ok(json) => Value::Json(json),
                            Err(_) => Value::Text(text),
                        },
                        (_, value) => value,
                    };
                    self.values.insert(column, value);
                }
                None => {
                    self.extras.insert(column, value);
                }
            }
        }
        self.persisted = self.values.clone();
        self.dirty.clear();
        self.exists = true;
    }

    // ------------------------------------------------------------------------
    // Attribute access
    // ------------------------------------------------------------------------

    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// Whether this record corresponds to a stored row.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// A declared field or a plain attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).or_else(|| self.extras.get(name))
    }

    pub fn try_get<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .ok_or_else(|| Error::query(format!("{} has no attribute `{name}`", self.schema.name())))?;
        T::from_value(value).map_err(|e| Error::validation(format!("{}.{name}: {e}", self.schema.name())))
    }

    /// Deserializes a JSON field into `T`.
    pub fn try_get_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let json: serde_json::Value = self.try_get(name)?;
        serde_json::from_value(json).map_err(|e| Error::validation(format!("{}.{name}: {e}", self.schema.name())))
    }

    /// Sets an attribute.
    ///
    /// For a declared field the value is converted to the column's type when
    /// possible, and the field is dirty exactly when the value differs from
    /// the one last loaded or saved. Undeclared names are stored as plain
    /// attributes and never persisted.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let Some(field) = self.schema.field(name) else {
            self.extras.insert(name.to_string(), value);
            return;
        };

        let value = coerce_lenient(field, value);
        if self.exists && self.persisted.get(name) == Some(&value) {
            self.dirty.remove(name);
        } else {
            self.dirty.insert(name.to_string());
        }
        self.values.insert(name.to_string(), value);
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Changed fields in declaration order.
    pub fn dirty_fields(&self) -> Vec<&str> {
        self.schema.fields().iter().map(|f| f.name.as_str()).filter(|name| self.dirty.contains(*name)).collect()
    }

    /// The current primary-key value, `Null` when unset.
    pub fn pk_value(&self) -> Value {
        self.values.get(&self.schema.primary_key().name).cloned().unwrap_or(Value::Null)
    }

    /// Declared fields in declaration order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema.fields().iter().map(|f| (f.name.as_str(), self.values.get(&f.name).unwrap_or(&Value::Null)))
    }

    /// Declared fields as a name-to-value map.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.values().map(|(name, value)| (name.to_string(), value.clone())).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let object = self
            .values()
            .map(|(name, value)| (name.to_string(), serde_json::to_value(value).unwrap_or(serde_json::Value::Null)))
            .collect();
        serde_json::Value::Object(object)
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Checks every declared field against its descriptor.
    pub fn validate(&self) -> Result<()> {
        self.schema.fields().iter().try_for_each(|field| self.check_field(field, true))
    }

    fn check_field(&self, field: &Field, inserting: bool) -> Result<()> {
        let name = format!("{}.{}", self.schema.name(), field.name);
        let value = self.values.get(&field.name).cloned().unwrap_or(Value::Null);

        if value.is_null() {
            let fallback = inserting && field.has_fallback();
            if !field.nullable && !fallback {
                return Err(Error::validation(format!("{name} cannot be null")));
            }
            return Ok(());
        }

        let value = field.field_type.coerce(value).map_err(|e| Error::validation(format!("{name}: {e}")))?;
        if let (Some(max), Value::Text(text)) = (field.max_length, &value) {
            let length = text.chars().count();
            if length > max {
                return Err(Error::validation(format!("{name} is {length} characters long, the limit is {max}")));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Inserts a transient record, or writes the dirty fields of a persisted
    /// one. A persisted record without changes sends nothing.
    pub async fn save<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<()> {
        if self.exists { self.update(conn).await } else { self.insert(conn).await }
    }

    async fn insert<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<()> {
        let schema = self.schema.clone();
        for field in schema.fields() {
            if let (Some(DefaultValue::Generator(generate)), Some(Value::Null)) = (&field.default, self.values.get(&field.name)) {
                self.values.insert(field.name.clone(), coerce_lenient(field, generate()));
            }
        }
        self.validate()?;

        let values: Vec<(String, Value)> = schema
            .fields()
            .iter()
            .filter(|f| !f.auto_increment)
            .filter_map(|f| match self.values.get(&f.name) {
                Some(value) if !value.is_null() => Some((f.name.clone(), f.field_type.coerce(value.clone()))),
                _ => None,
            })
            .map(|(name, value)| value.map(|v| (name, v)))
            .collect::<Result<_>>()?;

        let row = if values.is_empty() {
            let sql = format!("INSERT INTO {} DEFAULT VALUES RETURNING *", schema.table());
            conn.fetch_optional(&sql, &[]).await?
        } else {
            Some(QueryBuilder::new(schema.table()).values(values).insert(conn).await?)
        };
        let row = row.ok_or_else(|| Error::query(format!("INSERT into `{}` returned no row", schema.table())))?;

        self.hydrate(row);
        debug!("inserted {self}");
        Ok(())
    }

    async fn update<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let schema = self.schema.clone();
        let pk = schema.primary_key();
        let key = self.persisted_pk()?;

        let mut values = Vec::with_capacity(self.dirty.len());
        for field in schema.fields().iter().filter(|f| self.dirty.contains(&f.name)) {
            self.check_field(field, false)?;
            let value = self.values.get(&field.name).cloned().unwrap_or(Value::Null);
            values.push((field.name.clone(), field.field_type.coerce(value)?));
        }

        let rows = QueryBuilder::new(schema.table()).values(values).where_eq(&pk.name, key).update(conn).await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::query(format!("{self} no longer exists in `{}`", schema.table())))?;
        self.hydrate(row);
        Ok(())
    }

    /// The primary key the stored row is known by.
    fn persisted_pk(&self) -> Result<Value> {
        let pk = &self.schema.primary_key().name;
        let key = self.persisted.get(pk).or_else(|| self.values.get(pk)).cloned().unwrap_or(Value::Null);
        if key.is_null() {
            return Err(Error::query(format!("{} record has no primary key value", self.schema.name())));
        }
        Ok(key)
    }

    /// Deletes the stored row. Returns `false` when there was nothing to
    /// delete (transient record, or one already deleted).
    pub async fn delete<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<bool> {
        if !self.exists {
            return Ok(false);
        }
        let Ok(key) = self.persisted_pk() else {
            return Ok(false);
        };

        QueryBuilder::new(self.schema.table()).where_eq(&self.schema.primary_key().name, key).delete(conn).await?;
        self.exists = false;
        debug!("deleted {self}");
        Ok(true)
    }

    /// Reloads the stored row, discarding unsaved changes. Returns `false`
    /// (and marks the record transient) if the row is gone.
    pub async fn reload<C: Connection + ?Sized>(&mut self, conn: &C) -> Result<bool> {
        let key = self.persisted_pk()?;
        let row = QueryBuilder::new(self.schema.table()).where_eq(&self.schema.primary_key().name, key).first(conn).await?;
        match row {
            Some(row) => {
                self.hydrate(row);
                Ok(true)
            }
            None => {
                self.exists = false;
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------------

    /// A manager for the relationship declared as `name`.
    ///
    /// The related model is resolved by name on first use and cached on this
    /// record.
    pub fn related(&mut self, name: &str) -> Result<RelatedManager> {
        let relationship = self.schema.relationship(name)?.clone();
        let related = match self.related_schemas.get(name) {
            Some(related) => related.clone(),
            None => {
                let related = schema::lookup(&relationship.related_model)?;
                self.related_schemas.insert(name.to_string(), related.clone());
                related
            }
        };
        RelatedManager::new(self, name, relationship, related)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(id={})", self.schema.name(), self.pk_value())
    }
}

/// Serializes the declared fields as a map, like [`Record::to_map`].
impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.values())
    }
}

/// Coerces when possible and keeps the original otherwise, so that
/// [`Record::validate`] reports the problem at save time.
fn coerce_lenient(field: &Field, value: Value) -> Value {
    field.field_type.coerce(value.clone()).unwrap_or(value)
}
