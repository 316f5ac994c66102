//! Translation between [`Value`] and the PostgreSQL driver.
//!
//! Parameters are bound positionally with their natural PostgreSQL types.
//! Two cases need help from us:
//!
//! - `NULL` is bound without a declared type so the server infers it from the
//!   surrounding expression (a typed `NULL::text` would not assign to an
//!   integer column).
//! - JSON is bound as its serialized text under the `json` type name.
//!
//! Rows are decoded column by column using the column's reported type name.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{
    encode::IsNull,
    error::BoxDynError,
    postgres::{types::Oid, PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo},
    query::Query,
    Column, Postgres, Row as _, TypeInfo, ValueRef,
};
use uuid::Uuid;

use crate::{
    value::{Row, Value},
    Error, Result,
};

pub(crate) type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Builds a sqlx query with every parameter bound in order.
pub(crate) fn prepare<'q>(sql: &'q str, params: &'q [Value]) -> PgQuery<'q> {
    params.iter().fold(sqlx::query(sql), bind)
}

fn bind<'q>(query: PgQuery<'q>, value: &'q Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(UntypedNull),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Decimal(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Uuid(v) => query.bind(*v),
        Value::Json(v) => query.bind(JsonText(v.to_string())),
    }
}

/// A `NULL` whose type is left for the server to infer (OID 0).
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Serialized JSON sent with the `json` type.
struct JsonText(String);

impl sqlx::Type<Postgres> for JsonText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("json")
    }
}

impl sqlx::Encode<'_, Postgres> for JsonText {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> std::result::Result<IsNull, BoxDynError> {
        buf.extend_from_slice(self.0.as_bytes());
        Ok(IsNull::No)
    }
}

/// Decodes every column of a driver row.
pub(crate) fn decode_row(row: &PgRow) -> Result<Row> {
    let mut decoded = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name())
            .map_err(|e| Error::query(format!("cannot decode column `{}`: {e}", column.name())))?;
        decoded.push(column.name(), value);
    }
    Ok(decoded)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> std::result::Result<Value, sqlx::Error> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get::<bool, _>(idx)?),
        "INT2" => Value::Int(i64::from(row.try_get::<i16, _>(idx)?)),
        "INT4" => Value::Int(i64::from(row.try_get::<i32, _>(idx)?)),
        "INT8" => Value::Int(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => Value::Float(f64::from(row.try_get::<f32, _>(idx)?)),
        "FLOAT8" => Value::Float(row.try_get::<f64, _>(idx)?),
        "NUMERIC" => Value::Decimal(row.try_get::<Decimal, _>(idx)?),
        "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(idx)?.naive_utc()),
        "DATE" => Value::Date(row.try_get::<NaiveDate, _>(idx)?),
        "UUID" => Value::Uuid(row.try_get::<Uuid, _>(idx)?),
        "JSON" | "JSONB" => Value::Json(row.try_get::<serde_json::Value, _>(idx)?),
        _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}
