//! # Migration Module
//!
//! [`Migrator`] creates the tables of registered models and keeps a ledger of
//! named, hand-written migrations so each one runs exactly once.
//!
//! ```rust,ignore
//! db.migrator()
//!     .register::<User>()
//!     .register::<Course>()
//!     .run()
//!     .await?;
//!
//! let migrator = db.migrator();
//! migrator.apply("0002_users_add_bio", "ALTER TABLE users ADD COLUMN bio TEXT").await?;
//! ```

// ============================================================================
// External Crate Imports
// ============================================================================

use log::{debug, info};
use std::{collections::HashSet, sync::Arc};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::{Connection, Database},
    model::Model,
    relationship::RelationKind,
    schema::ModelSchema,
    value::Value,
    Result,
};

/// Table recording applied migrations.
pub const LEDGER_TABLE: &str = "migrations";

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS migrations (\
    id SERIAL PRIMARY KEY, \
    migration_name VARCHAR(255) NOT NULL UNIQUE, \
    applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)";

/// Table creation for registered models plus the migration ledger.
pub struct Migrator<'a> {
    db: &'a Database,
    schemas: Vec<Arc<ModelSchema>>,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db, schemas: Vec::new() }
    }

    /// Queues the table of `M`.
    pub fn register<M: Model>(self) -> Self {
        self.register_schema(M::schema())
    }

    pub fn register_schema(mut self, schema: Arc<ModelSchema>) -> Self {
        if !self.schemas.iter().any(|s| s.name() == schema.name()) {
            self.schemas.push(schema);
        }
        self
    }

    /// Creates every registered table with its indexes, in registration
    /// order, then the join tables of many-to-many relationships whose both
    /// ends are registered.
    pub async fn run(self) -> Result<Database> {
        for schema in &self.schemas {
            schema.create_table(self.db).await?;
        }
        for sql in join_table_statements(&self.schemas) {
            self.db.execute(&sql, &[]).await?;
        }
        Ok(self.db.clone())
    }

    // ------------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------------

    pub async fn ensure_ledger(&self) -> Result<()> {
        self.db.execute(LEDGER_DDL, &[]).await?;
        Ok(())
    }

    pub async fn is_applied(&self, name: &str) -> Result<bool> {
        self.ensure_ledger().await?;
        is_recorded(self.db, name).await
    }

    /// Runs `sql` and records `name`, in one transaction. Returns `false`
    /// without running anything when `name` is already recorded.
    ///
    /// `sql` is sent as a single prepared statement.
    pub async fn apply(&self, name: &str, sql: &str) -> Result<bool> {
        self.ensure_ledger().await?;

        let tx = self.db.begin().await?;
        if is_recorded(&tx, name).await? {
            tx.rollback().await?;
            debug!("migration {name} already applied");
            return Ok(false);
        }

        let outcome = async {
            tx.execute(sql, &[]).await?;
            tx.execute("INSERT INTO migrations (migration_name) VALUES ($1)", &[Value::from(name)]).await
        }
        .await;
        if let Err(err) = outcome {
            tx.rollback().await?;
            return Err(err);
        }
        tx.commit().await?;

        info!("applied migration {name}");
        Ok(true)
    }

    /// Applied migration names, oldest first.
    pub async fn applied(&self) -> Result<Vec<String>> {
        self.ensure_ledger().await?;
        let rows = self.db.fetch_all("SELECT migration_name FROM migrations ORDER BY id", &[]).await?;
        rows.iter().map(|row| row.try_get("migration_name")).collect()
    }
}

async fn is_recorded<C: Connection + ?Sized>(conn: &C, name: &str) -> Result<bool> {
    let row = conn.fetch_optional("SELECT 1 FROM migrations WHERE migration_name = $1", &[Value::from(name)]).await?;
    Ok(row.is_some())
}

/// Join-table DDL for many-to-many relationships between registered
/// schemas, one statement per join table.
fn join_table_statements(schemas: &[Arc<ModelSchema>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut statements = Vec::new();
    for schema in schemas {
        for (_, relationship) in schema.relationships() {
            if relationship.kind != RelationKind::ManyToMany {
                continue;
            }
            let Some(related) = schemas.iter().find(|s| s.name() == relationship.related_model) else { continue };
            let Some(through) = relationship.through.as_deref() else { continue };
            if !seen.insert(through.to_string()) {
                continue;
            }
            statements.extend(relationship.through_table_sql(schema, related));
        }
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        field::{Field, FieldType},
        relationship::Relationship,
    };
    use pretty_assertions::assert_eq;

    fn id() -> Field {
        Field::new("id", FieldType::Int).primary_key().auto_increment()
    }

    #[test]
    fn join_tables_need_both_ends_registered() {
        let students = ModelSchema::builder("MigrationTestStudent")
            .field(id())
            .relationship(
                "classes",
                Relationship::many_to_many("MigrationTestClass", "migration_test_enrollments")
                    .through_columns("student_id", "class_code"),
            )
            .build()
            .unwrap();
        let classes = ModelSchema::builder("MigrationTestClass")
            .field(Field::new("code", FieldType::Varchar).max_length(8).primary_key())
            .relationship(
                "students",
                Relationship::many_to_many("MigrationTestStudent", "migration_test_enrollments")
                    .through_columns("class_code", "student_id"),
            )
            .build()
            .unwrap();

        assert!(join_table_statements(&[students.clone()]).is_empty());
        assert_eq!(
            join_table_statements(&[students, classes]),
            vec![
                "CREATE TABLE IF NOT EXISTS migration_test_enrollments (student_id INTEGER NOT NULL, class_code VARCHAR(8) NOT NULL, \
                 PRIMARY KEY (student_id, class_code))"
            ]
        );
    }

    #[test]
    fn ledger_layout() {
        assert_eq!(
            LEDGER_DDL,
            "CREATE TABLE IF NOT EXISTS migrations (id SERIAL PRIMARY KEY, migration_name VARCHAR(255) NOT NULL UNIQUE, \
             applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
        );
    }
}
