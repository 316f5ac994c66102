//! # Query Builder Module
//!
//! A fluent builder for parameterized PostgreSQL statements. Values never get
//! interpolated into the SQL text: every value becomes a positional `$n`
//! placeholder and is returned alongside the statement.
//!
//! Identifiers (tables, columns, join targets) are written verbatim, so
//! callers can pass aliases such as `"courses c"` or qualified names such as
//! `"c.user_id"`. They must not come from untrusted input.
//!
//! ```rust,ignore
//! let (sql, params) = QueryBuilder::new("users")
//!     .select(["id", "name"])
//!     .where_eq("is_active", true)
//!     .where_in("role", ["admin", "staff"])
//!     .order_by("name", Order::Asc)
//!     .limit(10)
//!     .build_select();
//! // SELECT id, name FROM users WHERE is_active = $1 AND role IN ($2, $3) ORDER BY name ASC LIMIT 10
//! ```

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    database::Connection,
    value::{Row, Value},
    Error, Result,
};

// ============================================================================
// Enums
// ============================================================================

/// The statement a builder produces when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryKind {
    #[default]
    Select,
    Insert,
    Update,
    Delete,
}

/// Sort direction for [`QueryBuilder::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// What [`QueryBuilder::execute`] returns for each statement kind.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// Rows selected, inserted (`RETURNING *`) or updated (`RETURNING *`).
    Rows(Vec<Row>),
    /// Rows removed by a DELETE.
    Affected(u64),
}

// ============================================================================
// QueryBuilder Struct
// ============================================================================

/// Accumulates the pieces of one statement against one table.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    table: String,
    kind: QueryKind,
    select_fields: Vec<String>,
    where_clauses: Vec<String>,
    joins: Vec<String>,
    order_clauses: Vec<String>,
    group_by: Vec<String>,
    having_clauses: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    values: Vec<(String, Value)>,
    params: Vec<Value>,
    never_matches: bool,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), ..Self::default() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Parameters bound so far by WHERE and HAVING predicates.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Whether a predicate made the statement provably match no rows.
    pub fn matches_nothing(&self) -> bool {
        self.never_matches
    }

    fn next_placeholder(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    // ------------------------------------------------------------------------
    // Statement kind
    // ------------------------------------------------------------------------

    pub fn as_insert(mut self) -> Self {
        self.kind = QueryKind::Insert;
        self
    }

    pub fn as_update(mut self) -> Self {
        self.kind = QueryKind::Update;
        self
    }

    /// Turns the builder into a DELETE.
    ///
    /// **A DELETE without any WHERE predicate removes every row of the table.**
    pub fn as_delete(mut self) -> Self {
        self.kind = QueryKind::Delete;
        self
    }

    // ------------------------------------------------------------------------
    // Clauses
    // ------------------------------------------------------------------------

    /// Replaces the select list. An empty list selects `*`.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a raw predicate, ANDed with the others.
    ///
    /// Placeholders in `condition` must continue the numbering: the first one
    /// is `$` followed by `params().len() + 1`.
    ///
    /// ```rust,ignore
    /// QueryBuilder::new("users").where_raw("age > $1 AND age < $2", [18, 65]);
    /// ```
    pub fn where_raw<I, V>(mut self, condition: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.where_clauses.push(condition.into());
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// `field = $n`, or `field IS NULL` when `value` is null.
    pub fn where_eq(mut self, field: impl AsRef<str>, value: impl Into<Value>) -> Self {
        let value = value.into();
        let clause = if value.is_null() {
            format!("{} IS NULL", field.as_ref())
        } else {
            format!("{} = {}", field.as_ref(), self.next_placeholder(value))
        };
        self.where_clauses.push(clause);
        self
    }

    /// `field IN ($n, …)`. An empty list matches nothing: the builder records a
    /// `1 = 0` predicate and execution returns without contacting the server.
    pub fn where_in<I, V>(mut self, field: impl AsRef<str>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let placeholders: Vec<String> = values.into_iter().map(|v| self.next_placeholder(v.into())).collect();
        if placeholders.is_empty() {
            self.where_clauses.push("1 = 0".to_string());
            self.never_matches = true;
        } else {
            self.where_clauses.push(format!("{} IN ({})", field.as_ref(), placeholders.join(", ")));
        }
        self
    }

    pub fn where_like(mut self, field: impl AsRef<str>, pattern: impl Into<String>) -> Self {
        let placeholder = self.next_placeholder(Value::Text(pattern.into()));
        self.where_clauses.push(format!("{} LIKE {}", field.as_ref(), placeholder));
        self
    }

    pub fn where_between(mut self, field: impl AsRef<str>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        let low = self.next_placeholder(low.into());
        let high = self.next_placeholder(high.into());
        self.where_clauses.push(format!("{} BETWEEN {} AND {}", field.as_ref(), low, high));
        self
    }

    pub fn join(mut self, table: impl AsRef<str>, on: impl AsRef<str>) -> Self {
        self.joins.push(format!("JOIN {} ON {}", table.as_ref(), on.as_ref()));
        self
    }

    pub fn left_join(mut self, table: impl AsRef<str>, on: impl AsRef<str>) -> Self {
        self.joins.push(format!("LEFT JOIN {} ON {}", table.as_ref(), on.as_ref()));
        self
    }

    pub fn right_join(mut self, table: impl AsRef<str>, on: impl AsRef<str>) -> Self {
        self.joins.push(format!("RIGHT JOIN {} ON {}", table.as_ref(), on.as_ref()));
        self
    }

    pub fn order_by(mut self, field: impl AsRef<str>, direction: Order) -> Self {
        self.order_clauses.push(format!("{} {}", field.as_ref(), direction.as_sql()));
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Adds a raw HAVING predicate. Placeholder numbering continues the
    /// WHERE parameters, as with [`where_raw`](Self::where_raw).
    pub fn having<I, V>(mut self, condition: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.having_clauses.push(condition.into());
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Adds column values for INSERT or UPDATE, in order.
    pub fn values<I, K, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.values.extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((field.into(), value.into()));
        self
    }

    // ------------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------------

    fn where_sql(&self) -> Option<String> {
        (!self.where_clauses.is_empty()).then(|| self.where_clauses.join(" AND "))
    }

    pub fn build_select(&self) -> (String, Vec<Value>) {
        let fields = if self.select_fields.is_empty() { "*".to_string() } else { self.select_fields.join(", ") };
        let mut sql = format!("SELECT {} FROM {}", fields, self.table);

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if let Some(where_sql) = self.where_sql() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.having_clauses.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.having_clauses.join(" AND "));
        }
        if !self.order_clauses.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_clauses.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        (sql, self.params.clone())
    }

    /// `INSERT … VALUES (…) RETURNING *`. Fails without values.
    pub fn build_insert(&self) -> Result<(String, Vec<Value>)> {
        if self.values.is_empty() {
            return Err(Error::query(format!("INSERT into `{}` has no values", self.table)));
        }

        let columns: Vec<&str> = self.values.iter().map(|(name, _)| name.as_str()).collect();
        let placeholders: Vec<String> = (1..=self.values.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        Ok((sql, self.values.iter().map(|(_, v)| v.clone()).collect()))
    }

    /// `UPDATE … SET … WHERE … RETURNING *`. Fails without values.
    ///
    /// SET placeholders come first (`$1..$N`); the WHERE placeholders are
    /// renumbered to follow them, and the parameters are the SET values
    /// followed by the WHERE values.
    pub fn build_update(&self) -> Result<(String, Vec<Value>)> {
        if self.values.is_empty() {
            return Err(Error::query(format!("UPDATE of `{}` has no values", self.table)));
        }

        let assignments: Vec<String> =
            self.values.iter().enumerate().map(|(i, (name, _))| format!("{} = ${}", name, i + 1)).collect();
        let mut sql = format!("UPDATE {} SET {}", self.table, assignments.join(", "));
        if let Some(where_sql) = self.where_sql() {
            sql.push_str(" WHERE ");
            sql.push_str(&shift_placeholders(&where_sql, self.values.len()));
        }
        sql.push_str(" RETURNING *");

        let mut params: Vec<Value> = self.values.iter().map(|(_, v)| v.clone()).collect();
        params.extend(self.params.iter().cloned());
        Ok((sql, params))
    }

    /// `DELETE FROM … WHERE …`.
    ///
    /// **Without WHERE predicates this deletes every row of the table.**
    pub fn build_delete(&self) -> (String, Vec<Value>) {
        let mut sql = format!("DELETE FROM {}", self.table);
        if let Some(where_sql) = self.where_sql() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_sql);
        }
        (sql, self.params.clone())
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Runs the statement selected by the builder's [`QueryKind`].
    pub async fn execute<C: Connection + ?Sized>(self, conn: &C) -> Result<QueryOutput> {
        match self.kind {
            QueryKind::Select => self.fetch_all(conn).await.map(QueryOutput::Rows),
            QueryKind::Insert => self.insert(conn).await.map(|row| QueryOutput::Rows(vec![row])),
            QueryKind::Update => self.update(conn).await.map(QueryOutput::Rows),
            QueryKind::Delete => self.delete(conn).await.map(QueryOutput::Affected),
        }
    }

    pub async fn fetch_all<C: Connection + ?Sized>(self, conn: &C) -> Result<Vec<Row>> {
        if self.never_matches {
            return Ok(Vec::new());
        }
        let (sql, params) = self.build_select();
        conn.fetch_all(&sql, &params).await
    }

    /// The first matching row; applies `LIMIT 1`.
    pub async fn first<C: Connection + ?Sized>(self, conn: &C) -> Result<Option<Row>> {
        if self.never_matches {
            return Ok(None);
        }
        let (sql, params) = self.limit(1).build_select();
        conn.fetch_optional(&sql, &params).await
    }

    /// `SELECT COUNT(*) AS count` over the same FROM/JOIN/WHERE; ordering,
    /// limit and offset are dropped. A grouped query counts its groups.
    pub async fn count<C: Connection + ?Sized>(mut self, conn: &C) -> Result<i64> {
        if self.never_matches {
            return Ok(0);
        }
        self.order_clauses.clear();
        self.limit = None;
        self.offset = None;

        let (sql, params) = if self.group_by.is_empty() {
            self.select_fields = vec!["COUNT(*) AS count".to_string()];
            self.build_select()
        } else {
            self.select_fields = vec!["1".to_string()];
            let (inner, params) = self.build_select();
            (format!("SELECT COUNT(*) AS count FROM ({inner}) AS grouped"), params)
        };
        match conn.fetch_scalar(&sql, &params).await? {
            Some(Value::Int(count)) => Ok(count),
            None | Some(Value::Null) => Ok(0),
            Some(other) => Err(Error::query(format!("COUNT returned a {} value", other.type_name()))),
        }
    }

    pub async fn exists<C: Connection + ?Sized>(self, conn: &C) -> Result<bool> {
        Ok(self.select(["1"]).first(conn).await?.is_some())
    }

    /// Inserts the builder's values and returns the stored row.
    pub async fn insert<C: Connection + ?Sized>(self, conn: &C) -> Result<Row> {
        let (sql, params) = self.build_insert()?;
        conn.fetch_optional(&sql, &params)
            .await?
            .ok_or_else(|| Error::query(format!("INSERT into `{}` returned no row", self.table)))
    }

    /// Updates matching rows and returns them as stored.
    pub async fn update<C: Connection + ?Sized>(self, conn: &C) -> Result<Vec<Row>> {
        let (sql, params) = self.build_update()?;
        if self.never_matches {
            return Ok(Vec::new());
        }
        conn.fetch_all(&sql, &params).await
    }

    /// Deletes matching rows and returns how many were removed.
    pub async fn delete<C: Connection + ?Sized>(self, conn: &C) -> Result<u64> {
        if self.never_matches {
            return Ok(0);
        }
        let (sql, params) = self.build_delete();
        conn.execute(&sql, &params).await
    }
}

/// Adds `offset` to every `$n` placeholder outside quoted literals and
/// quoted identifiers.
pub(crate) fn shift_placeholders(sql: &str, offset: usize) -> String {
    if offset == 0 {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;
    let mut in_identifier = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_identifier => {
                in_literal = !in_literal;
                out.push(c);
            }
            '"' if !in_literal => {
                in_identifier = !in_identifier;
                out.push(c);
            }
            '$' if !in_literal && !in_identifier && chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                out.push('$');
                match digits.parse::<usize>() {
                    Ok(n) => out.push_str(&(n + offset).to_string()),
                    Err(_) => out.push_str(&digits),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;
    use pretty_assertions::assert_eq;

    #[test]
    fn select_with_every_clause() {
        let (sql, params) = QueryBuilder::new("users u")
            .select(["u.id", "COUNT(c.id) AS courses"])
            .left_join("courses c", "c.user_id = u.id")
            .where_eq("u.is_active", true)
            .where_like("u.username", "a%")
            .group_by(["u.id"])
            .having("COUNT(c.id) > $3", [1])
            .order_by("u.id", Order::Desc)
            .limit(5)
            .offset(10)
            .build_select();

        assert_eq!(
            sql,
            "SELECT u.id, COUNT(c.id) AS courses FROM users u LEFT JOIN courses c ON c.user_id = u.id \
             WHERE u.is_active = $1 AND u.username LIKE $2 GROUP BY u.id HAVING COUNT(c.id) > $3 \
             ORDER BY u.id DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(params, vec![Value::Bool(true), Value::from("a%"), Value::Int(1)]);
    }

    #[test]
    fn placeholders_follow_parameter_count() {
        let (sql, params) = QueryBuilder::new("t")
            .where_raw("a > $1", [10])
            .where_in("b", [1, 2, 3])
            .where_between("c", 4, 5)
            .build_select();

        assert_eq!(sql, "SELECT * FROM t WHERE a > $1 AND b IN ($2, $3, $4) AND c BETWEEN $5 AND $6");
        assert_eq!(params.len(), 6);
    }

    #[test]
    fn null_equality_becomes_is_null() {
        let (sql, params) = QueryBuilder::new("t").where_eq("deleted_at", Value::Null).where_eq("id", 1).build_select();
        assert_eq!(sql, "SELECT * FROM t WHERE deleted_at IS NULL AND id = $1");
        assert_eq!(params, vec![Value::Int(1)]);
    }

    #[test]
    fn empty_in_list_is_provably_false() {
        let qb = QueryBuilder::new("t").where_in("id", Vec::<i64>::new());
        assert!(qb.matches_nothing());
        let (sql, params) = qb.build_select();
        assert_eq!(sql, "SELECT * FROM t WHERE 1 = 0");
        assert!(params.is_empty());
    }

    #[test]
    fn insert_returns_everything() {
        let (sql, params) =
            QueryBuilder::new("accounts").values([("name", Value::from("A")), ("balance", Value::Int(0))]).build_insert().unwrap();
        assert_eq!(sql, "INSERT INTO accounts (name, balance) VALUES ($1, $2) RETURNING *");
        assert_eq!(params, vec![Value::from("A"), Value::Int(0)]);
    }

    #[test]
    fn insert_and_update_require_values() {
        assert!(matches!(QueryBuilder::new("t").build_insert(), Err(Error::Query { .. })));
        assert!(matches!(QueryBuilder::new("t").where_eq("id", 1).build_update(), Err(Error::Query { .. })));
    }

    #[test]
    fn update_shifts_where_placeholders_after_set() {
        let (sql, params) = QueryBuilder::new("t")
            .where_eq("id", 5)
            .where_raw("note <> '$1 stays' AND score > $2", [3])
            .values([("a", 1), ("b", 2)])
            .build_update()
            .unwrap();

        assert_eq!(sql, "UPDATE t SET a = $1, b = $2 WHERE id = $3 AND note <> '$1 stays' AND score > $4 RETURNING *");
        assert_eq!(params, vec![Value::Int(1), Value::Int(2), Value::Int(5), Value::Int(3)]);
    }

    #[test]
    fn shifting_handles_multi_digit_placeholders() {
        assert_eq!(shift_placeholders("a = $9 AND b = $10", 3), "a = $12 AND b = $13");
        assert_eq!(shift_placeholders("\"$1\" = $1", 2), "\"$1\" = $3");
        assert_eq!(shift_placeholders("price = $", 2), "price = $");
    }

    #[test]
    fn delete_without_where_targets_the_whole_table() {
        assert_eq!(QueryBuilder::new("t").as_delete().build_delete().0, "DELETE FROM t");
        let (sql, params) = QueryBuilder::new("t").where_eq("id", 2).build_delete();
        assert_eq!(sql, "DELETE FROM t WHERE id = $1");
        assert_eq!(params, vec![Value::Int(2)]);
    }

    #[tokio::test]
    async fn matching_nothing_skips_the_server() -> Result<()> {
        let conn = RecordingConnection::new();
        let empty = || QueryBuilder::new("t").where_in("id", Vec::<i64>::new());

        assert!(empty().fetch_all(&conn).await?.is_empty());
        assert!(empty().first(&conn).await?.is_none());
        assert_eq!(empty().count(&conn).await?, 0);
        assert_eq!(empty().delete(&conn).await?, 0);
        assert!(empty().value("a", 1).update(&conn).await?.is_empty());

        assert!(conn.statements().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn count_drops_ordering_and_paging() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![vec![("count", Value::Int(7))]]);

        let count = QueryBuilder::new("t").where_eq("a", 1).order_by("a", Order::Asc).limit(3).offset(6).count(&conn).await?;

        assert_eq!(count, 7);
        assert_eq!(conn.statements()[0].0, "SELECT COUNT(*) AS count FROM t WHERE a = $1");
        Ok(())
    }

    #[tokio::test]
    async fn grouped_count_counts_groups() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![vec![("count", Value::Int(3))]]);

        let count = QueryBuilder::new("orders")
            .where_eq("status", "paid")
            .group_by(["customer_id"])
            .having("SUM(total) > $2", [100])
            .order_by("customer_id", Order::Asc)
            .limit(2)
            .count(&conn)
            .await?;

        assert_eq!(count, 3);
        let (sql, params) = &conn.statements()[0];
        assert_eq!(
            sql,
            "SELECT COUNT(*) AS count FROM (SELECT 1 FROM orders WHERE status = $1 GROUP BY customer_id \
             HAVING SUM(total) > $2) AS grouped"
        );
        assert_eq!(params, &vec![Value::from("paid"), Value::Int(100)]);
        Ok(())
    }

    #[tokio::test]
    async fn first_limits_to_one_row() -> Result<()> {
        let conn = RecordingConnection::new();
        QueryBuilder::new("t").first(&conn).await?;
        assert_eq!(conn.statements()[0].0, "SELECT * FROM t LIMIT 1");
        Ok(())
    }

    #[tokio::test]
    async fn execute_dispatches_on_kind() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_affected(4);

        let output = QueryBuilder::new("t").where_eq("flag", false).as_delete().execute(&conn).await?;

        assert_eq!(output, QueryOutput::Affected(4));
        assert_eq!(conn.statements()[0].0, "DELETE FROM t WHERE flag = $1");
        Ok(())
    }
}
