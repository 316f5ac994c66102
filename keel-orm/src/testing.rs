//! An in-memory [`Connection`] for unit tests: records every statement and
//! answers with scripted results in FIFO order.

use futures::future::BoxFuture;
use std::{collections::VecDeque, sync::Mutex};

use crate::{
    database::Connection,
    value::{Row, Value},
    Error, Result,
};

enum Scripted {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(String),
}

#[derive(Default)]
pub(crate) struct RecordingConnection {
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    script: Mutex<VecDeque<Scripted>>,
}

impl RecordingConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues the result of the next fetch.
    pub(crate) fn push_rows(&self, rows: Vec<Vec<(&str, Value)>>) {
        let rows = rows.into_iter().map(|columns| columns.into_iter().collect()).collect();
        self.script.lock().unwrap().push_back(Scripted::Rows(rows));
    }

    /// Queues the affected-row count of the next execute.
    pub(crate) fn push_affected(&self, count: u64) {
        self.script.lock().unwrap().push_back(Scripted::Affected(count));
    }

    /// Makes the next statement fail with a query error.
    pub(crate) fn push_error(&self, message: &str) {
        self.script.lock().unwrap().push_back(Scripted::Fail(message.to_string()));
    }

    pub(crate) fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.statements.lock().unwrap().clone()
    }

    pub(crate) fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|(sql, _)| sql).collect()
    }

    fn next(&self, sql: &str, params: &[Value]) -> Option<Scripted> {
        self.statements.lock().unwrap().push((sql.to_string(), params.to_vec()));
        self.script.lock().unwrap().pop_front()
    }
}

impl Connection for RecordingConnection {
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            match self.next(sql, params) {
                Some(Scripted::Affected(count)) => Ok(count),
                Some(Scripted::Rows(rows)) => Ok(rows.len() as u64),
                Some(Scripted::Fail(message)) => Err(Error::query(message)),
                None => Ok(0),
            }
        })
    }

    fn fetch_all<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Vec<Row>>> {
        Box::pin(async move {
            match self.next(sql, params) {
                Some(Scripted::Rows(rows)) => Ok(rows),
                Some(Scripted::Affected(_)) | None => Ok(Vec::new()),
                Some(Scripted::Fail(message)) => Err(Error::query(message)),
            }
        })
    }

    fn fetch_optional<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<Option<Row>>> {
        Box::pin(async move { Ok(self.fetch_all(sql, params).await?.into_iter().next()) })
    }
}
