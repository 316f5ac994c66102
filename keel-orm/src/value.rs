//! # Value Module
//!
//! [`Value`] is the dynamically typed cell that flows between records, the
//! query builder and the driver. Every SQL parameter is a `Value` and every
//! decoded column becomes one.
//!
//! Conversions go both ways: `From<T> for Value` for Rust scalars (and
//! `Option<T>` for nullable ones), and [`FromValue`] to read a typed value back
//! out of a record or row.

// ============================================================================
// External Crate Imports
// ============================================================================

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{ser::SerializeMap, Serialize, Serializer};
use std::{fmt, str::FromStr};
use uuid::Uuid;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{Error, Result};

// ============================================================================
// Value Enum
// ============================================================================

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Decimal(Decimal),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl Value {
    /// Current UTC time, usable as a generator default.
    pub fn now() -> Value {
        Value::Timestamp(Utc::now().naive_utc())
    }

    /// Current UTC date, usable as a generator default.
    pub fn today() -> Value {
        Value::Date(Utc::now().date_naive())
    }

    /// A fresh random UUID, usable as a generator default.
    pub fn new_uuid() -> Value {
        Value::Uuid(Uuid::new_v4())
    }

    /// Serializes any `serde` value into a [`Value::Json`].
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
        serde_json::to_value(value)
            .map(Value::Json)
            .map_err(|e| Error::validation(format!("value is not representable as JSON: {e}")))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Decimal(_) => "decimal",
            Value::Timestamp(_) => "timestamp",
            Value::Date(_) => "date",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Reads this value as `T`.
    pub fn decode<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

// ============================================================================
// Conversions into Value
// ============================================================================

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v.naive_utc())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<&Value> for Value {
    fn from(v: &Value) -> Self {
        v.clone()
    }
}

// ============================================================================
// Conversions out of Value
// ============================================================================

/// Reads a typed Rust value out of a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(expected: &str, found: &Value) -> Result<T> {
    Err(Error::validation(format!("expected {expected}, found {}", found.type_name())))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => mismatch("boolean", other),
        }
    }
}

macro_rules! impl_from_value_int {
    ($($ty:ty),*) => {
        $(impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self> {
                match value {
                    Value::Int(v) => <$ty>::try_from(*v)
                        .map_err(|_| Error::validation(format!("integer {v} is out of range for {}", stringify!($ty)))),
                    Value::Decimal(d) if d.fract().is_zero() => d
                        .to_i64()
                        .and_then(|v| <$ty>::try_from(v).ok())
                        .ok_or_else(|| Error::validation(format!("decimal {d} is out of range for {}", stringify!($ty)))),
                    other => mismatch(stringify!($ty), other),
                }
            }
        })*
    };
}

impl_from_value_int!(i16, i32, i64);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            Value::Decimal(d) => d.to_f64().ok_or_else(|| Error::validation(format!("decimal {d} does not fit in f64"))),
            other => mismatch("float", other),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        f64::from_value(value).map(|v| v as f32)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v.clone()),
            Value::Uuid(v) => Ok(v.to_string()),
            Value::Json(serde_json::Value::String(v)) => Ok(v.clone()),
            other => mismatch("text", other),
        }
    }
}

impl FromValue for Decimal {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Decimal(v) => Ok(*v),
            Value::Int(v) => Ok(Decimal::from(*v)),
            Value::Float(v) => {
                Decimal::try_from(*v).map_err(|e| Error::validation(format!("float {v} is not a decimal: {e}")))
            }
            Value::Text(v) => {
                Decimal::from_str(v).map_err(|e| Error::validation(format!("`{v}` is not a decimal: {e}")))
            }
            other => mismatch("decimal", other),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(v) => Ok(*v),
            Value::Text(v) => parse_timestamp(v),
            other => mismatch("timestamp", other),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        NaiveDateTime::from_value(value).map(|v| Utc.from_utc_datetime(&v))
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(v) => Ok(*v),
            Value::Timestamp(v) => Ok(v.date()),
            Value::Text(v) => parse_date(v),
            other => mismatch("date", other),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Uuid(v) => Ok(*v),
            Value::Text(v) => Uuid::parse_str(v).map_err(|e| Error::validation(format!("`{v}` is not a uuid: {e}"))),
            other => mismatch("uuid", other),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(v) => Ok(serde_json::from_str(v).unwrap_or_else(|_| serde_json::Value::String(v.clone()))),
            other => serde_json::to_value(other).map_err(|e| Error::validation(e.to_string())),
        }
    }
}

pub(crate) fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

    if let Ok(v) = DateTime::parse_from_rfc3339(text) {
        return Ok(v.naive_utc());
    }
    for format in FORMATS {
        if let Ok(v) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(v);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    Err(Error::validation(format!("`{text}` is not a timestamp")))
}

pub(crate) fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| Error::validation(format!("`{text}` is not a date: {e}")))
}

// ============================================================================
// Row
// ============================================================================

/// One result row: column names paired with decoded values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((column.into(), value.into()));
    }

    /// Looks a column up by name. The last column with that name wins, which
    /// matches what a `SELECT a.*, b.*` caller usually expects of a map.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().rev().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    /// Reads a column as `T`. A missing column is an error.
    pub fn try_get<T: FromValue>(&self, column: &str) -> Result<T> {
        match self.get(column) {
            Some(value) => T::from_value(value),
            None => Err(Error::query(format!("column `{column}` is not present in the row"))),
        }
    }

    /// The first column's value, as returned by scalar queries.
    pub fn first(&self) -> Option<&Value> {
        self.columns.first().map(|(_, value)| value)
    }

    pub fn into_first(self) -> Option<Value> {
        self.columns.into_iter().next().map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Row { columns: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.into_iter()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_convert_to_null() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some(7i32)), Value::Int(7));
    }

    #[test]
    fn typed_reads() {
        assert_eq!(i32::from_value(&Value::Int(42)).unwrap(), 42);
        assert!(i16::from_value(&Value::Int(1 << 20)).is_err());
        assert_eq!(Option::<String>::from_value(&Value::Null).unwrap(), None);
        assert_eq!(Decimal::from_value(&Value::Int(3)).unwrap(), Decimal::from(3));
        assert!(bool::from_value(&Value::Text("yes".into())).is_err());
    }

    #[test]
    fn text_json_is_parsed_when_read_as_json() {
        let parsed = serde_json::Value::from_value(&Value::Text("{\"a\":1}".into())).unwrap();
        assert_eq!(parsed, serde_json::json!({"a": 1}));
        let kept = serde_json::Value::from_value(&Value::Text("not json".into())).unwrap();
        assert_eq!(kept, serde_json::json!("not json"));
    }

    #[test]
    fn timestamps_parse_common_layouts() {
        assert!(parse_timestamp("2024-01-02 03:04:05").is_ok());
        assert!(parse_timestamp("2024-01-02T03:04:05.123").is_ok());
        assert!(parse_timestamp("2024-01-02T03:04:05Z").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn row_lookup_and_serialization() {
        let row: Row = vec![("id", Value::Int(1)), ("name", Value::from("Ann"))].into_iter().collect();
        assert_eq!(row.first(), Some(&Value::Int(1)));
        assert_eq!(row.try_get::<String>("name").unwrap(), "Ann");
        assert!(row.try_get::<i64>("missing").is_err());
        assert_eq!(serde_json::to_value(&row).unwrap(), serde_json::json!({"id": 1, "name": "Ann"}));
    }
}
