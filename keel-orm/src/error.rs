//! # Error Module
//!
//! Every fallible operation in Keel ORM returns [`Result<T>`]. Failures are
//! grouped into four categories so callers can react without parsing messages:
//!
//! - [`Error::Connection`]: the pool cannot be created or a connection cannot
//!   be obtained (bad DSN, unreachable server, acquire timeout, closed pool).
//! - [`Error::Query`]: a statement is malformed before it is sent, or the
//!   server rejected it. Server errors keep their SQLSTATE code.
//! - [`Error::Validation`]: a value or a schema declaration does not conform.
//! - [`Error::TransactionState`]: an operation was attempted on a transaction
//!   that has already been committed or rolled back.
//!
//! Nothing in the crate retries; errors surface to the immediate caller.

use thiserror::Error;

/// The error type for all Keel ORM operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("query error: {message}")]
    Query {
        message: String,
        /// SQLSTATE reported by the server, e.g. `23505` for a unique violation.
        sql_state: Option<String>,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transaction error: {0}")]
    TransactionState(String),
}

/// Shorthand for `std::result::Result<T, keel_orm::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a connection error without an underlying driver error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a query error for a statement that could not be built.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), sql_state: None, source: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transaction_state(message: impl Into<String>) -> Self {
        Self::TransactionState(message.into())
    }

    /// The SQLSTATE code, if the server rejected the statement.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Whether this error means a connection could not be used at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Whether the server rejected the statement because of a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        self.sql_state() == Some("23505")
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(ref msg) => {
                Error::Connection { message: msg.to_string(), source: Some(err) }
            }
            sqlx::Error::PoolTimedOut => {
                Error::Connection { message: "timed out acquiring a pooled connection".into(), source: Some(err) }
            }
            sqlx::Error::PoolClosed => {
                Error::Connection { message: "the connection pool is closed".into(), source: Some(err) }
            }
            sqlx::Error::Io(ref io) => Error::Connection { message: io.to_string(), source: Some(err) },
            sqlx::Error::Tls(ref tls) => Error::Connection { message: tls.to_string(), source: Some(err) },
            sqlx::Error::Database(ref db_err) => {
                let message = db_err.message().to_string();
                let sql_state = db_err.code().map(|code| code.to_string());
                Error::Query { message, sql_state, source: Some(err) }
            }
            other => Error::Query { message: other.to_string(), sql_state: None, source: Some(other) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_connection_errors() {
        assert!(Error::from(sqlx::Error::PoolTimedOut).is_connection());
        assert!(Error::from(sqlx::Error::PoolClosed).is_connection());
    }

    #[test]
    fn decode_errors_are_query_errors() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Query { sql_state: None, .. }));
    }

    #[test]
    fn constructors_pick_the_right_category() {
        assert!(matches!(Error::query("no values"), Error::Query { .. }));
        assert!(matches!(Error::validation("bad"), Error::Validation(_)));
        assert!(matches!(Error::transaction_state("gone"), Error::TransactionState(_)));
        assert_eq!(Error::query("x").sql_state(), None);
    }
}
