//! # Field Module
//!
//! Column descriptors: the logical type of a field, its constraints, its
//! default, and the DDL fragment that creates it.

use rust_decimal::{prelude::FromPrimitive, prelude::ToPrimitive, Decimal};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::{
    value::{parse_date, parse_timestamp, Value},
    Error, Result,
};

// ============================================================================
// Field Type
// ============================================================================

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    SmallInt,
    Int,
    BigInt,
    Varchar,
    Text,
    Boolean,
    Timestamp,
    Date,
    Decimal,
    Double,
    Json,
    Uuid,
}

impl FieldType {
    /// The PostgreSQL type name used in DDL.
    pub fn sql_name(self) -> &'static str {
        match self {
            FieldType::SmallInt => "SMALLINT",
            FieldType::Int => "INTEGER",
            FieldType::BigInt => "BIGINT",
            FieldType::Varchar => "VARCHAR",
            FieldType::Text => "TEXT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Decimal => "DECIMAL",
            FieldType::Double => "DOUBLE PRECISION",
            FieldType::Json => "JSON",
            FieldType::Uuid => "UUID",
        }
    }

    fn is_integer(self) -> bool {
        matches!(self, FieldType::SmallInt | FieldType::Int | FieldType::BigInt)
    }

    /// Converts `value` to the representation this column stores.
    ///
    /// Text is parsed for numeric, temporal, UUID and JSON columns; numbers
    /// widen to decimals; integral decimals narrow to integers. `Null` passes
    /// through unchanged. Anything else is a validation error.
    pub fn coerce(self, value: Value) -> Result<Value> {
        let fail = |value: &Value| {
            Err(Error::validation(format!("{} value cannot be stored in a {} column", value.type_name(), self.sql_name())))
        };

        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),

            (t, Value::Int(v)) if t.is_integer() => Ok(Value::Int(v)),
            (t, Value::Decimal(d)) if t.is_integer() && d.fract().is_zero() => match d.to_i64() {
                Some(v) => Ok(Value::Int(v)),
                None => fail(&Value::Decimal(d)),
            },
            (t, Value::Float(f)) if t.is_integer() && f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::Int(f as i64)),
            (t, Value::Text(s)) if t.is_integer() => match s.trim().parse::<i64>() {
                Ok(v) => Ok(Value::Int(v)),
                Err(_) => fail(&Value::Text(s)),
            },

            (FieldType::Varchar | FieldType::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (FieldType::Varchar | FieldType::Text, Value::Json(serde_json::Value::String(s))) => Ok(Value::Text(s)),
            (
                FieldType::Varchar | FieldType::Text,
                v @ (Value::Int(_) | Value::Float(_) | Value::Decimal(_) | Value::Uuid(_) | Value::Bool(_)),
            ) => Ok(Value::Text(v.to_string())),

            (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldType::Boolean, Value::Int(v @ (0 | 1))) => Ok(Value::Bool(v == 1)),
            (FieldType::Boolean, Value::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "0" => Ok(Value::Bool(false)),
                _ => fail(&Value::Text(s)),
            },

            (FieldType::Timestamp, Value::Timestamp(v)) => Ok(Value::Timestamp(v)),
            (FieldType::Timestamp, Value::Date(d)) => Ok(Value::Timestamp(d.and_time(chrono::NaiveTime::MIN))),
            (FieldType::Timestamp, Value::Text(s)) => parse_timestamp(&s).map(Value::Timestamp),

            (FieldType::Date, Value::Date(d)) => Ok(Value::Date(d)),
            (FieldType::Date, Value::Timestamp(v)) => Ok(Value::Date(v.date())),
            (FieldType::Date, Value::Text(s)) => parse_date(&s).map(Value::Date),

            (FieldType::Decimal, Value::Decimal(d)) => Ok(Value::Decimal(d)),
            (FieldType::Decimal, Value::Int(v)) => Ok(Value::Decimal(Decimal::from(v))),
            (FieldType::Decimal, Value::Float(f)) => match Decimal::from_f64(f) {
                Some(d) => Ok(Value::Decimal(d)),
                None => fail(&Value::Float(f)),
            },
            (FieldType::Decimal, Value::Text(s)) => match Decimal::from_str(s.trim()) {
                Ok(d) => Ok(Value::Decimal(d)),
                Err(_) => fail(&Value::Text(s)),
            },

            (FieldType::Double, Value::Float(f)) => Ok(Value::Float(f)),
            (FieldType::Double, Value::Int(v)) => Ok(Value::Float(v as f64)),
            (FieldType::Double, Value::Decimal(d)) => match d.to_f64() {
                Some(f) => Ok(Value::Float(f)),
                None => fail(&Value::Decimal(d)),
            },
            (FieldType::Double, Value::Text(s)) => match s.trim().parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => fail(&Value::Text(s)),
            },

            (FieldType::Json, Value::Json(j)) => Ok(Value::Json(j)),
            (FieldType::Json, Value::Text(s)) => {
                Ok(Value::Json(serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))))
            }
            (FieldType::Json, other) => Value::json(&other),

            (FieldType::Uuid, Value::Uuid(u)) => Ok(Value::Uuid(u)),
            (FieldType::Uuid, Value::Text(s)) => match Uuid::parse_str(s.trim()) {
                Ok(u) => Ok(Value::Uuid(u)),
                Err(_) => fail(&Value::Text(s)),
            },

            (_, other) => fail(&other),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.to_ascii_lowercase().as_str() {
            "smallint" | "int2" => FieldType::SmallInt,
            "int" | "integer" | "int4" => FieldType::Int,
            "bigint" | "int8" => FieldType::BigInt,
            "varchar" => FieldType::Varchar,
            "text" => FieldType::Text,
            "bool" | "boolean" => FieldType::Boolean,
            "timestamp" => FieldType::Timestamp,
            "date" => FieldType::Date,
            "decimal" | "numeric" => FieldType::Decimal,
            "double" | "float" | "float8" => FieldType::Double,
            "json" => FieldType::Json,
            "uuid" => FieldType::Uuid,
            other => return Err(Error::validation(format!("unknown field type `{other}`"))),
        };
        Ok(kind)
    }
}

// ============================================================================
// Default Values
// ============================================================================

/// How a field gets a value when none is supplied.
#[derive(Clone)]
pub enum DefaultValue {
    Static(Value),
    /// Called each time a record is constructed without the field.
    Generator(fn() -> Value),
}

impl DefaultValue {
    pub fn produce(&self) -> Value {
        match self {
            DefaultValue::Static(v) => v.clone(),
            DefaultValue::Generator(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Static(v) => f.debug_tuple("Static").field(v).finish(),
            DefaultValue::Generator(_) => f.write_str("Generator"),
        }
    }
}

// ============================================================================
// Field Descriptor
// ============================================================================

/// Describes one persisted column of a model.
///
/// ```rust,ignore
/// Field::new("username", FieldType::Varchar).max_length(50).unique().not_null()
/// ```
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub index: bool,
    pub max_length: Option<usize>,
    pub default: Option<DefaultValue>,
    pub description: Option<String>,
}

impl Field {
    /// A nullable column with no constraints.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            unique: false,
            index: false,
            max_length: None,
            default: None,
            description: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn max_length(mut self, length: usize) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Static(value.into()));
        self
    }

    /// A default computed at construction time, such as [`Value::now`].
    pub fn default_with(mut self, generator: fn() -> Value) -> Self {
        self.default = Some(DefaultValue::Generator(generator));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the server or the field itself supplies a value when none is given.
    pub fn has_fallback(&self) -> bool {
        self.auto_increment || self.default.is_some()
    }

    /// The column definition used in `CREATE TABLE`.
    ///
    /// Order: type, `PRIMARY KEY`, `NOT NULL`, `UNIQUE`, `DEFAULT`.
    pub fn to_sql_definition(&self) -> String {
        let sql_type = match (self.field_type, self.auto_increment) {
            (FieldType::BigInt, true) => "BIGSERIAL".to_string(),
            (FieldType::Int | FieldType::SmallInt, true) => "SERIAL".to_string(),
            _ => self.storage_type(),
        };

        let mut parts = vec![self.name.clone(), sql_type];
        if self.primary_key {
            parts.push("PRIMARY KEY".into());
        }
        if !self.nullable && !self.primary_key {
            parts.push("NOT NULL".into());
        }
        if self.unique && !self.primary_key {
            parts.push("UNIQUE".into());
        }
        if let Some(default) = self.default_sql() {
            parts.push(format!("DEFAULT {default}"));
        }
        parts.join(" ")
    }

    /// The column type ignoring auto-increment, as a referencing column needs it.
    pub fn storage_type(&self) -> String {
        match (self.field_type, self.max_length) {
            (FieldType::Varchar, Some(len)) => format!("VARCHAR({len})"),
            (FieldType::Varchar, None) => "VARCHAR(255)".to_string(),
            (kind, _) => kind.sql_name().to_string(),
        }
    }

    fn default_sql(&self) -> Option<String> {
        if self.auto_increment {
            return None;
        }
        match self.default.as_ref()? {
            DefaultValue::Generator(_) => match self.field_type {
                FieldType::Timestamp => Some("CURRENT_TIMESTAMP".into()),
                FieldType::Date => Some("CURRENT_DATE".into()),
                _ => None,
            },
            DefaultValue::Static(value) => sql_literal(value),
        }
    }
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn sql_literal(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(true) => Some("TRUE".into()),
        Value::Bool(false) => Some("FALSE".into()),
        Value::Int(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Decimal(v) => Some(v.to_string()),
        Value::Json(v) => Some(format!("{}::json", quote_literal(&v.to_string()))),
        Value::Text(_) | Value::Timestamp(_) | Value::Date(_) | Value::Uuid(_) => Some(quote_literal(&value.to_string())),
    }
}
