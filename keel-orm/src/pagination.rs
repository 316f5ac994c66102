//! # Pagination Module
//!
//! Page/limit bookkeeping on top of [`QueryBuilder`]: a `COUNT(*)` for the
//! total, then the page itself with `LIMIT`/`OFFSET` applied.

// ============================================================================
// External Crate Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{database::Connection, query_builder::QueryBuilder, value::Row, Result};

pub const DEFAULT_MAX_LIMIT: usize = 100;
/// Page size used when the requested one exceeds the maximum.
pub const FALLBACK_LIMIT: usize = 10;

/// One page of results plus the totals needed to render a pager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    /// Rows matching the query, ignoring pagination.
    pub total: i64,
    /// Zero-based page index.
    pub page: usize,
    pub limit: usize,
    pub total_pages: i64,
}

impl<T> Paginated<T> {
    /// Converts every item, keeping the page metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            limit: self.limit,
            total_pages: self.total_pages,
        }
    }
}

/// Requested page and page size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    /// Zero-based page index
    pub page: usize,
    pub limit: usize,
    /// Largest accepted page size
    pub max_limit: usize,
}

impl Pagination {
    /// A page request with a custom ceiling. A `limit` above `max_limit`
    /// falls back to [`FALLBACK_LIMIT`].
    pub fn new_with_limit(page: usize, limit: usize, max_limit: usize) -> Self {
        let limit = if limit > max_limit { FALLBACK_LIMIT } else { limit };
        Self { page, limit, max_limit }
    }

    pub fn new(page: usize, limit: usize) -> Self {
        Self::new_with_limit(page, limit, DEFAULT_MAX_LIMIT)
    }

    pub fn offset(&self) -> usize {
        self.page * self.limit
    }

    /// Sets `LIMIT` and `OFFSET` on `query`.
    pub fn apply(self, query: QueryBuilder) -> QueryBuilder {
        query.limit(self.limit as u64).offset(self.offset() as u64)
    }

    /// Counts the rows matching `query`, then fetches the requested page.
    ///
    /// ```rust,ignore
    /// let page = Pagination::new(0, 20).paginate(users.query().where_eq("is_active", true), &db).await?;
    /// let users = page.map(|row| users.hydrate(row));
    /// ```
    pub async fn paginate<C: Connection + ?Sized>(self, query: QueryBuilder, conn: &C) -> Result<Paginated<Row>> {
        let total = query.clone().count(conn).await?;
        let data = self.apply(query).fetch_all(conn).await?;

        let total_pages = if self.limit == 0 { 0 } else { (total + self.limit as i64 - 1) / self.limit as i64 };
        Ok(Paginated { data, total, page: self.page, limit: self.limit, total_pages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::RecordingConnection, value::Value};
    use pretty_assertions::assert_eq;

    #[test]
    fn oversized_limits_fall_back() {
        assert_eq!(Pagination::new(0, 500).limit, FALLBACK_LIMIT);
        assert_eq!(Pagination::new(0, 100).limit, 100);
        assert_eq!(Pagination::new_with_limit(0, 30, 25).limit, FALLBACK_LIMIT);
    }

    #[tokio::test]
    async fn paginate_counts_then_fetches_the_page() -> Result<()> {
        let conn = RecordingConnection::new();
        conn.push_rows(vec![vec![("count", Value::Int(45))]]);
        conn.push_rows(vec![vec![("id", Value::Int(21))], vec![("id", Value::Int(22))]]);

        let page = Pagination::new(2, 10).paginate(QueryBuilder::new("posts").where_eq("draft", false), &conn).await?;

        assert_eq!(page.total, 45);
        assert_eq!(page.total_pages, 5);
        assert_eq!(page.data.len(), 2);
        assert_eq!(
            conn.sql(),
            vec![
                "SELECT COUNT(*) AS count FROM posts WHERE draft = $1",
                "SELECT * FROM posts WHERE draft = $1 LIMIT 10 OFFSET 20",
            ]
        );
        Ok(())
    }
}
