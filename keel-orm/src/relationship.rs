//! # Relationship Module
//!
//! Declarative relationships between models and the [`RelatedManager`] that
//! reads and edits them for one parent record.
//!
//! | Kind | Foreign key lives on | `all()` returns |
//! |---|---|---|
//! | one-to-many | related rows | rows whose key equals the parent's primary key |
//! | many-to-one | the parent | the single row the parent's key points to |
//! | one-to-one | either side | many-to-one when the parent declares the key, else the first child |
//! | many-to-many | a join table | rows linked through the join table |
//!
//! Join-table columns default to `<singular table>_id` for each side, where
//! the singular form drops one trailing `s` (`users` → `user_id`).

// ============================================================================
// External Crate Imports
// ============================================================================

use std::sync::Arc;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::Connection,
    query_builder::QueryBuilder,
    record::Record,
    schema::ModelSchema,
    value::{Row, Value},
    Error, Result,
};

// ============================================================================
// Relationship Descriptor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Describes how a model relates to another, referenced by model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub kind: RelationKind,
    /// Name of the related model, resolved through the schema registry.
    pub related_model: String,
    pub foreign_key: Option<String>,
    /// Join table of a many-to-many relationship.
    pub through: Option<String>,
    /// Name of the inverse relationship on the related model, if declared.
    pub related_name: Option<String>,
    /// Join-table column referencing the owning model.
    pub source_column: Option<String>,
    /// Join-table column referencing the related model.
    pub target_column: Option<String>,
}

impl Relationship {
    fn with(kind: RelationKind, related_model: impl Into<String>) -> Self {
        Self {
            kind,
            related_model: related_model.into(),
            foreign_key: None,
            through: None,
            related_name: None,
            source_column: None,
            target_column: None,
        }
    }

    pub fn one_to_one(related_model: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self { foreign_key: Some(foreign_key.into()), ..Self::with(RelationKind::OneToOne, related_model) }
    }

    /// Related rows carry `foreign_key` pointing at this model's primary key.
    pub fn one_to_many(related_model: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self { foreign_key: Some(foreign_key.into()), ..Self::with(RelationKind::OneToMany, related_model) }
    }

    /// This model carries `foreign_key` pointing at the related primary key.
    pub fn many_to_one(related_model: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self { foreign_key: Some(foreign_key.into()), ..Self::with(RelationKind::ManyToOne, related_model) }
    }

    pub fn many_to_many(related_model: impl Into<String>, through: impl Into<String>) -> Self {
        Self { through: Some(through.into()), ..Self::with(RelationKind::ManyToMany, related_model) }
    }

    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    /// Overrides the join-table column names.
    pub fn through_columns(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_column = Some(source.into());
        self.target_column = Some(target.into());
        self
    }

    /// Join-table columns `(owner side, related side)`.
    pub fn join_columns(&self, owner: &ModelSchema, related: &ModelSchema) -> (String, String) {
        let source = self.source_column.clone().unwrap_or_else(|| join_column(owner.table()));
        let target = self.target_column.clone().unwrap_or_else(|| join_column(related.table()));
        (source, target)
    }

    /// `CREATE TABLE` for the join table of a many-to-many relationship, with
    /// a composite primary key so a pair can only be linked once.
    pub fn through_table_sql(&self, owner: &ModelSchema, related: &ModelSchema) -> Option<String> {
        let through = self.through.as_deref().filter(|_| self.kind == RelationKind::ManyToMany)?;
        let (source, target) = self.join_columns(owner, related);
        Some(format!(
            "CREATE TABLE IF NOT EXISTS {through} ({source} {} NOT NULL, {target} {} NOT NULL, PRIMARY KEY ({source}, {target}))",
            owner.primary_key().storage_type(),
            related.primary_key().storage_type(),
        ))
    }
}

fn join_column(table: &str) -> String {
    format!("{}_id", table.strip_suffix('s').unwrap_or(table))
}

// ============================================================================
// Related Manager
// ============================================================================

/// Reads and edits one relationship of one parent record.
///
/// Obtained from [`Record::related`]. The manager keeps a snapshot of the
/// parent's keys taken when it was created.
#[derive(Debug, Clone)]
pub struct RelatedManager {
    name: String,
    relationship: Relationship,
    owner: Arc<ModelSchema>,
    related: Arc<ModelSchema>,
    parent_pk: Value,
    /// Set when the parent holds the foreign key (many-to-one, owning one-to-one).
    owning_key: Option<Value>,
}

impl RelatedManager {
    pub(crate) fn new(parent: &Record, name: &str, relationship: Relationship, related: Arc<ModelSchema>) -> Result<Self> {
        let owner = parent.schema().clone();
        let owning_key = match (relationship.kind, relationship.foreign_key.as_deref()) {
            (RelationKind::ManyToOne | RelationKind::OneToOne, Some(fk)) if owner.has_field(fk) => {
                Some(parent.get(fk).cloned().unwrap_or(Value::Null))
            }
            _ => None,
        };

        Ok(Self { name: name.to_string(), relationship, owner, related, parent_pk: parent.pk_value(), owning_key })
    }

    pub fn relationship(&self) -> &Relationship {
        &self.relationship
    }

    pub fn related_schema(&self) -> &Arc<ModelSchema> {
        &self.related
    }

    fn parent_pk(&self) -> Result<&Value> {
        if self.parent_pk.is_null() {
            return Err(Error::query(format!("`{}` needs a saved {} record", self.name, self.owner.name())));
        }
        Ok(&self.parent_pk)
    }

    fn foreign_key(&self) -> Result<&str> {
        self.relationship
            .foreign_key
            .as_deref()
            .ok_or_else(|| Error::query(format!("relationship `{}` has no foreign key", self.name)))
    }

    /// `(join table, owner column, related column)`.
    fn through(&self) -> Result<(&str, String, String)> {
        let through = self
            .relationship
            .through
            .as_deref()
            .ok_or_else(|| Error::query(format!("relationship `{}` has no through table", self.name)))?;
        let (source, target) = self.relationship.join_columns(&self.owner, &self.related);
        Ok((through, source, target))
    }

    fn check_related(&self, record: &Record) -> Result<()> {
        if record.schema().name() != self.related.name() {
            return Err(Error::query(format!(
                "`{}` relates {} records, got {}",
                self.name,
                self.related.name(),
                record.schema().name()
            )));
        }
        Ok(())
    }

    fn owning_side_error(&self) -> Error {
        Error::query(format!(
            "`{}` is stored on the {} record; assign `{}` there and save it",
            self.name,
            self.owner.name(),
            self.relationship.foreign_key.as_deref().unwrap_or_default()
        ))
    }

    fn hydrate_all(&self, rows: Vec<Row>) -> Vec<Record> {
        rows.into_iter().map(|row| Record::from_row(self.related.clone(), row)).collect()
    }

    fn children(&self) -> Result<QueryBuilder> {
        Ok(self.related.query().where_eq(self.foreign_key()?, self.parent_pk()?.clone()))
    }

    fn linked(&self) -> Result<QueryBuilder> {
        let (through, source, target) = self.through()?;
        Ok(QueryBuilder::new(format!("{} r", self.related.table()))
            .select(["r.*"])
            .join(format!("{through} t"), format!("r.{} = t.{target}", self.related.primary_key().name))
            .where_eq(format!("t.{source}"), self.parent_pk()?.clone()))
    }

    /// Every related record.
    pub async fn all<C: Connection + ?Sized>(&self, conn: &C) -> Result<Vec<Record>> {
        if let Some(key) = &self.owning_key {
            if key.is_null() {
                return Ok(Vec::new());
            }
            let row = self.related.query().where_eq(&self.related.primary_key().name, key.clone()).first(conn).await?;
            return Ok(self.hydrate_all(row.into_iter().collect()));
        }

        let rows = match self.relationship.kind {
            RelationKind::OneToMany => self.children()?.fetch_all(conn).await?,
            RelationKind::OneToOne => self.children()?.limit(1).fetch_all(conn).await?,
            RelationKind::ManyToMany => self.linked()?.fetch_all(conn).await?,
            RelationKind::ManyToOne => Vec::new(),
        };
        Ok(self.hydrate_all(rows))
    }

    /// Links `record` to the parent.
    ///
    /// One-to-many (and one-to-one stored on the related side) assigns the
    /// foreign key and saves `record`. Many-to-many inserts the join row
    /// unless it already exists, so adding twice leaves one link.
    pub async fn add<C: Connection + ?Sized>(&self, conn: &C, record: &mut Record) -> Result<()> {
        self.check_related(record)?;
        if self.owning_key.is_some() || self.relationship.kind == RelationKind::ManyToOne {
            return Err(self.owning_side_error());
        }

        match self.relationship.kind {
            RelationKind::ManyToMany => {
                let (through, source, target) = self.through()?;
                let child = record.pk_value();
                if child.is_null() {
                    return Err(Error::query(format!("save the {} record before linking it", self.related.name())));
                }
                let parent = self.parent_pk()?.clone();

                let linked = QueryBuilder::new(through)
                    .where_eq(&source, parent.clone())
                    .where_eq(&target, child.clone())
                    .exists(conn)
                    .await?;
                if !linked {
                    QueryBuilder::new(through).values([(source, parent), (target, child)]).insert(conn).await?;
                }
                Ok(())
            }
            _ => {
                record.set(self.foreign_key()?, self.parent_pk()?.clone());
                record.save(conn).await
            }
        }
    }

    pub async fn add_all<C: Connection + ?Sized>(&self, conn: &C, records: &mut [Record]) -> Result<()> {
        for record in records.iter_mut() {
            self.add(conn, record).await?;
        }
        Ok(())
    }

    /// Unlinks `record`. One-to-many children keep existing with a null
    /// foreign key; many-to-many join rows are deleted.
    pub async fn remove<C: Connection + ?Sized>(&self, conn: &C, record: &mut Record) -> Result<()> {
        self.check_related(record)?;
        if self.owning_key.is_some() || self.relationship.kind == RelationKind::ManyToOne {
            return Err(self.owning_side_error());
        }

        match self.relationship.kind {
            RelationKind::ManyToMany => {
                let (through, source, target) = self.through()?;
                QueryBuilder::new(through)
                    .where_eq(&source, self.parent_pk()?.clone())
                    .where_eq(&target, record.pk_value())
                    .delete(conn)
                    .await?;
                Ok(())
            }
            _ => {
                record.set(self.foreign_key()?, Value::Null);
                record.save(conn).await
            }
        }
    }

    pub async fn remove_all<C: Connection + ?Sized>(&self, conn: &C, records: &mut [Record]) -> Result<()> {
        for record in records.iter_mut() {
            self.remove(conn, record).await?;
        }
        Ok(())
    }

    /// Unlinks every related record and returns how many links were removed.
    pub async fn clear<C: Connection + ?Sized>(&self, conn: &C) -> Result<u64> {
        if self.owning_key.is_some() || self.relationship.kind == RelationKind::ManyToOne {
            return Err(self.owning_side_error());
        }

        match self.relationship.kind {
            RelationKind::ManyToMany => {
                let (through, source, _) = self.through()?;
                QueryBuilder::new(through).where_eq(&source, self.parent_pk()?.clone()).delete(conn).await
            }
            _ => {
                let fk = self.foreign_key()?;
                let orphaned = self.children()?.value(fk, Value::Null).update(conn).await?;
                Ok(orphaned.len() as u64)
            }
        }
    }

    /// Number of related records (join rows for many-to-many).
    pub async fn count<C: Connection + ?Sized>(&self, conn: &C) -> Result<i64> {
        match self.relationship.kind {
            RelationKind::ManyToMany => {
                let (through, source, _) = self.through()?;
                QueryBuilder::new(through).where_eq(&source, self.parent_pk()?.clone()).count(conn).await
            }
            _ => Ok(self.all(conn).await?.len() as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        field::{Field, FieldType},
        testing::RecordingConnection,
    };
    use pretty_assertions::assert_eq;

    fn id() -> Field {
        Field::new("id", FieldType::Int).primary_key().auto_increment()
    }

    fn users() -> Arc<ModelSchema> {
        ModelSchema::builder("RelTestUser")
            .field(id())
            .field(Field::new("name", FieldType::Text))
            .relationship("courses", Relationship::one_to_many("RelTestCourse", "user_id"))
            .relationship("enrolled", Relationship::many_to_many("RelTestCourse", "rel_test_enrollments"))
            .build()
            .unwrap()
    }

    fn courses() -> Arc<ModelSchema> {
        ModelSchema::builder("RelTestCourse")
            .field(id())
            .field(Field::new("title", FieldType::Text))
            .field(Field::new("user_id", FieldType::Int))
            .relationship("owner", Relationship::many_to_one("RelTestUser", "user_id"))
            .build()
            .unwrap()
    }

    fn saved(schema: Arc<ModelSchema>, columns: Vec<(&str, Value)>) -> Record {
        Record::from_row(schema, columns.into_iter().collect())
    }

    #[tokio::test]
    async fn one_to_many_reads_children_by_foreign_key() -> Result<()> {
        let (users, _courses) = (users(), courses());
        let conn = RecordingConnection::new();
        conn.push_rows(vec![vec![("id", Value::Int(10)), ("title", Value::from("Rust")), ("user_id", Value::Int(1))]]);

        let mut user = saved(users, vec![("id", Value::Int(1)), ("name", Value::from("ann"))]);
        let children = user.related("courses")?.all(&conn).await?;

        assert_eq!(conn.sql(), vec!["SELECT * FROM rel_test_courses WHERE user_id = $1"]);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].schema().name(), "RelTestCourse");
        assert_eq!(children[0].try_get::<String>("title")?, "Rust");
        Ok(())
    }

    #[tokio::test]
    async fn many_to_many_reads_through_the_join_table() -> Result<()> {
        let (users, _courses) = (users(), courses());
        let conn = RecordingConnection::new();

        let mut user = saved(users, vec![("id", Value::Int(1))]);
        user.related("enrolled")?.all(&conn).await?;

        assert_eq!(
            conn.sql(),
            vec!["SELECT r.* FROM rel_test_courses r JOIN rel_test_enrollments t ON r.id = t.rel_test_course_id WHERE t.rel_test_user_id = $1"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn many_to_many_add_is_idempotent() -> Result<()> {
        let (users, courses) = (users(), courses());
        let conn = RecordingConnection::new();
        let mut user = saved(users, vec![("id", Value::Int(1))]);
        let mut course = saved(courses, vec![("id", Value::Int(5))]);
        let enrolled = user.related("enrolled")?;

        conn.push_rows(vec![]);
        conn.push_rows(vec![vec![("rel_test_user_id", Value::Int(1)), ("rel_test_course_id", Value::Int(5))]]);
        enrolled.add(&conn, &mut course).await?;
        conn.push_rows(vec![vec![("?column?", Value::Int(1))]]);
        enrolled.add(&conn, &mut course).await?;

        assert_eq!(
            conn.sql(),
            vec![
                "SELECT 1 FROM rel_test_enrollments WHERE rel_test_user_id = $1 AND rel_test_course_id = $2 LIMIT 1",
                "INSERT INTO rel_test_enrollments (rel_test_user_id, rel_test_course_id) VALUES ($1, $2) RETURNING *",
                "SELECT 1 FROM rel_test_enrollments WHERE rel_test_user_id = $1 AND rel_test_course_id = $2 LIMIT 1",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn one_to_many_add_assigns_the_key_and_saves() -> Result<()> {
        let (users, courses) = (users(), courses());
        let conn = RecordingConnection::new();
        let mut user = saved(users, vec![("id", Value::Int(1))]);
        let mut course = Record::new(courses, [("title", "Rust")]);

        conn.push_rows(vec![vec![("id", Value::Int(3)), ("title", Value::from("Rust")), ("user_id", Value::Int(1))]]);
        user.related("courses")?.add(&conn, &mut course).await?;

        let (sql, params) = &conn.statements()[0];
        assert_eq!(sql, "INSERT INTO rel_test_courses (title, user_id) VALUES ($1, $2) RETURNING *");
        assert_eq!(params[1], Value::Int(1));
        assert!(course.exists());
        Ok(())
    }

    #[tokio::test]
    async fn many_to_one_follows_the_parent_key() -> Result<()> {
        let (users, courses) = (users(), courses());
        let conn = RecordingConnection::new();
        let mut orphan = saved(courses.clone(), vec![("id", Value::Int(3)), ("user_id", Value::Null)]);
        assert!(orphan.related("owner")?.all(&conn).await?.is_empty());
        assert!(conn.statements().is_empty());

        let mut course = saved(courses, vec![("id", Value::Int(3)), ("user_id", Value::Int(1))]);
        let owner = course.related("owner")?;
        owner.all(&conn).await?;
        assert_eq!(conn.sql(), vec!["SELECT * FROM rel_test_users WHERE id = $1 LIMIT 1"]);

        let mut other = saved(users, vec![("id", Value::Int(2))]);
        assert!(matches!(owner.add(&conn, &mut other).await, Err(Error::Query { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn linking_requires_saved_records() -> Result<()> {
        let (users, courses) = (users(), courses());
        let conn = RecordingConnection::new();

        let mut user = saved(users.clone(), vec![("id", Value::Int(1))]);
        let mut draft = Record::new(courses.clone(), [("title", "Draft")]);
        assert!(matches!(user.related("enrolled")?.add(&conn, &mut draft).await, Err(Error::Query { .. })));

        let mut unsaved_user = Record::new(users, [("name", "new")]);
        assert!(unsaved_user.related("courses")?.all(&conn).await.is_err());
        Ok(())
    }

    #[test]
    fn join_table_ddl_uses_a_composite_key() {
        let (users, courses) = (users(), courses());
        let rel = users.relationship("enrolled").unwrap();
        assert_eq!(
            rel.through_table_sql(&users, &courses).unwrap(),
            "CREATE TABLE IF NOT EXISTS rel_test_enrollments (rel_test_user_id INTEGER NOT NULL, rel_test_course_id INTEGER NOT NULL, \
             PRIMARY KEY (rel_test_user_id, rel_test_course_id))"
        );
        assert!(users.relationship("courses").unwrap().through_table_sql(&users, &courses).is_none());
    }
}
