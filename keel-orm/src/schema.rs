//! # Schema Module
//!
//! [`ModelSchema`] is the immutable description of a model: its name, its
//! table, its ordered fields and its named relationships. Schemas are built
//! once, shared as `Arc<ModelSchema>`, and registered by model name so
//! relationships can refer to models that are declared later (or refer to each
//! other).
//!
//! ```rust,ignore
//! let users = ModelSchema::builder("User")
//!     .field(Field::new("id", FieldType::Int).primary_key().auto_increment())
//!     .field(Field::new("username", FieldType::Varchar).max_length(50).unique().not_null())
//!     .relationship("courses", Relationship::one_to_many("Course", "user_id"))
//!     .build()?;
//! assert_eq!(users.table(), "users");
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use heck::ToSnakeCase;
use log::debug;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    field::Field,
    relationship::{RelationKind, Relationship},
    Error, Result,
};

// ============================================================================
// ModelSchema Struct
// ============================================================================

/// Immutable metadata of one model.
#[derive(Debug)]
pub struct ModelSchema {
    name: String,
    table: String,
    fields: Vec<Field>,
    relationships: Vec<(String, Relationship)>,
    primary_key: usize,
}

impl ModelSchema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder { name: name.into(), table: None, fields: Vec::new(), relationships: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn primary_key(&self) -> &Field {
        &self.fields[self.primary_key]
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships.iter().map(|(name, rel)| (name.as_str(), rel))
    }

    pub fn relationship(&self, name: &str) -> Result<&Relationship> {
        self.relationships
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rel)| rel)
            .ok_or_else(|| Error::query(format!("{} has no relationship named `{name}`", self.name)))
    }

    // ------------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------------

    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self.fields.iter().map(Field::to_sql_definition).collect();
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.table, columns.join(", "))
    }

    /// One `CREATE INDEX` per indexed, non-primary-key field.
    pub fn index_sql(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.index && !f.primary_key)
            .map(|f| format!("CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table} ({col})", table = self.table, col = f.name))
            .collect()
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table)
    }

    /// Indexes worth adding: declared indexes plus many-to-one foreign keys
    /// that are neither indexed nor unique.
    pub fn suggest_indexes(&self) -> Vec<String> {
        let mut suggestions = self.index_sql();
        for (_, rel) in &self.relationships {
            if rel.kind != RelationKind::ManyToOne {
                continue;
            }
            let Some(fk) = rel.foreign_key.as_deref().and_then(|fk| self.field(fk)) else { continue };
            if !fk.index && !fk.unique && !fk.primary_key {
                suggestions.push(format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table} ({col})",
                    table = self.table,
                    col = fk.name
                ));
            }
        }
        suggestions
    }
}

// ============================================================================
// SchemaBuilder Struct
// ============================================================================

/// Collects fields and relationships, then validates and registers the schema.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    name: String,
    table: Option<String>,
    fields: Vec<Field>,
    relationships: Vec<(String, Relationship)>,
}

impl SchemaBuilder {
    /// Overrides the table name. Defaults to the snake_cased model name plus `s`.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, relationship: Relationship) -> Self {
        self.relationships.push((name.into(), relationship));
        self
    }

    /// Validates the declaration and registers it under the model name.
    pub fn build(self) -> Result<Arc<ModelSchema>> {
        let schema = Arc::new(self.validate()?);
        register(schema.clone());
        Ok(schema)
    }

    fn validate(self) -> Result<ModelSchema> {
        let invalid = |msg: String| Error::validation(format!("model {}: {msg}", self.name));

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("field `{}` is declared twice", field.name)));
            }
        }

        let keys: Vec<usize> = self.fields.iter().enumerate().filter(|(_, f)| f.primary_key).map(|(i, _)| i).collect();
        let primary_key = match keys.as_slice() {
            [idx] => *idx,
            [] => return Err(invalid("no primary key field".into())),
            _ => return Err(invalid(format!("{} primary key fields, expected exactly one", keys.len()))),
        };

        let mut rel_names = HashSet::new();
        for (name, rel) in &self.relationships {
            if !rel_names.insert(name.as_str()) {
                return Err(invalid(format!("relationship `{name}` is declared twice")));
            }
            match rel.kind {
                RelationKind::ManyToMany if rel.through.is_none() => {
                    return Err(invalid(format!("many-to-many relationship `{name}` needs a through table")));
                }
                RelationKind::ManyToMany => match (rel.source_column.as_deref(), rel.target_column.as_deref()) {
                    (Some(source), Some(target)) if source == target => {
                        return Err(invalid(format!("relationship `{name}` uses `{source}` for both join columns")));
                    }
                    (None, None) if rel.related_model == self.name => {
                        return Err(invalid(format!(
                            "relationship `{name}` joins {} to itself and needs explicit through columns",
                            self.name
                        )));
                    }
                    _ => {}
                },
                _ if rel.foreign_key.is_none() => {
                    return Err(invalid(format!("relationship `{name}` needs a foreign key")));
                }
                RelationKind::ManyToOne => {
                    let fk = rel.foreign_key.as_deref().unwrap_or_default();
                    if !seen.contains(fk) {
                        return Err(invalid(format!("relationship `{name}` uses `{fk}`, which is not a field")));
                    }
                }
                _ => {}
            }
        }

        let table = self.table.unwrap_or_else(|| format!("{}s", self.name.to_snake_case()));
        Ok(ModelSchema { name: self.name, table, fields: self.fields, relationships: self.relationships, primary_key })
    }
}

// ============================================================================
// Registry
// ============================================================================

fn registry() -> &'static RwLock<HashMap<String, Arc<ModelSchema>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<ModelSchema>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Makes `schema` resolvable by its model name, replacing any earlier one.
pub fn register(schema: Arc<ModelSchema>) {
    debug!("registering model {} (table {})", schema.name(), schema.table());
    registry().write().unwrap_or_else(PoisonError::into_inner).insert(schema.name().to_string(), schema);
}

/// Resolves a model by name.
pub fn lookup(name: &str) -> Result<Arc<ModelSchema>> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| Error::query(format!("model `{name}` is not registered")))
}
