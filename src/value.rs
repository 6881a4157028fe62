//! Row values and safe extraction.
//!
//! Executors hand back [`Record`]s: ordered `(column, sea_query::Value)` pairs decoded
//! from the driver's row type. Entities scan themselves out of a record with
//! [`Record::try_get`], which goes through [`TryGetable`] so nulls and type
//! mismatches surface as scan errors instead of panics.

use crate::error::{Result, StoreError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sea_query::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Error type for value extraction failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueExtractionError {
    /// The value is null (None variant)
    NullValue,
    /// The value type doesn't match the expected type
    TypeMismatch { expected: String, actual: String },
    /// Value conversion failed (e.g., overflow, invalid format)
    ConversionError(String),
}

impl std::fmt::Display for ValueExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueExtractionError::NullValue => write!(f, "Value is null"),
            ValueExtractionError::TypeMismatch { expected, actual } => {
                write!(f, "Type mismatch: expected {}, got {}", expected, actual)
            }
            ValueExtractionError::ConversionError(msg) => {
                write!(f, "Conversion error: {}", msg)
            }
        }
    }
}

impl std::error::Error for ValueExtractionError {}

/// Trait for safe value extraction with error handling
///
/// ```rust
/// use rowkeeper::{TryGetable, ValueExtractionError};
/// use sea_query::Value;
///
/// let value = Value::Int(Some(42));
/// assert_eq!(<i32 as TryGetable>::try_get(value), Ok(42));
///
/// let null_value = Value::Int(None);
/// assert!(matches!(
///     <i32 as TryGetable>::try_get(null_value),
///     Err(ValueExtractionError::NullValue)
/// ));
/// ```
pub trait TryGetable: Sized {
    /// Extract a non-null value of this type.
    fn try_get(value: Value) -> Result<Self, ValueExtractionError>;

    /// Extract a value, mapping SQL NULL to `None`.
    fn try_get_opt(value: Value) -> Result<Option<Self>, ValueExtractionError> {
        match Self::try_get(value) {
            Ok(v) => Ok(Some(v)),
            Err(ValueExtractionError::NullValue) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn mismatch(expected: &str, value: &Value) -> ValueExtractionError {
    ValueExtractionError::TypeMismatch {
        expected: expected.to_string(),
        actual: format!("{:?}", value),
    }
}

macro_rules! impl_try_getable {
    ($type:ty, $variant:ident, $expected:expr) => {
        impl TryGetable for $type {
            fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
                match value {
                    Value::$variant(Some(v)) => Ok(v),
                    Value::$variant(None) => Err(ValueExtractionError::NullValue),
                    _ => Err(mismatch($expected, &value)),
                }
            }
        }
    };
}

impl_try_getable!(bool, Bool, "Bool");
impl_try_getable!(f32, Float, "Float");
impl_try_getable!(String, String, "String");
impl_try_getable!(Vec<u8>, Bytes, "Bytes");

impl TryGetable for i16 {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::SmallInt(Some(v)) => Ok(v),
            Value::SmallInt(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("SmallInt", &value)),
        }
    }
}

impl TryGetable for i32 {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Int(Some(v)) => Ok(v),
            Value::SmallInt(Some(v)) => Ok(i32::from(v)),
            Value::Int(None) | Value::SmallInt(None) => Err(ValueExtractionError::NullValue),
            Value::BigInt(Some(v)) => i32::try_from(v).map_err(|_| {
                ValueExtractionError::ConversionError(format!("{v} does not fit in i32"))
            }),
            _ => Err(mismatch("Int", &value)),
        }
    }
}

impl TryGetable for i64 {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::BigInt(Some(v)) => Ok(v),
            Value::Int(Some(v)) => Ok(i64::from(v)),
            Value::SmallInt(Some(v)) => Ok(i64::from(v)),
            Value::BigInt(None) | Value::Int(None) | Value::SmallInt(None) => {
                Err(ValueExtractionError::NullValue)
            }
            _ => Err(mismatch("BigInt", &value)),
        }
    }
}

impl TryGetable for f64 {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Double(Some(v)) => Ok(v),
            Value::Float(Some(v)) => Ok(f64::from(v)),
            Value::Double(None) | Value::Float(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("Double", &value)),
        }
    }
}

impl TryGetable for serde_json::Value {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Json(Some(v)) => Ok(serde_json::Value::clone(&v)),
            Value::Json(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("Json", &value)),
        }
    }
}

impl TryGetable for Uuid {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Uuid(Some(v)) => Ok(Uuid::clone(&v)),
            Value::Uuid(None) => Err(ValueExtractionError::NullValue),
            Value::String(Some(s)) => Uuid::parse_str(&s)
                .map_err(|e| ValueExtractionError::ConversionError(e.to_string())),
            _ => Err(mismatch("Uuid", &value)),
        }
    }
}

impl TryGetable for DateTime<Utc> {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::ChronoDateTimeUtc(Some(v)) => Ok(DateTime::<Utc>::clone(&v)),
            Value::ChronoDateTimeUtc(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("ChronoDateTimeUtc", &value)),
        }
    }
}

impl TryGetable for NaiveDateTime {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::ChronoDateTime(Some(v)) => Ok(NaiveDateTime::clone(&v)),
            Value::ChronoDateTime(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("ChronoDateTime", &value)),
        }
    }
}

impl TryGetable for NaiveDate {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::ChronoDate(Some(v)) => Ok(NaiveDate::clone(&v)),
            Value::ChronoDate(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("ChronoDate", &value)),
        }
    }
}

/// Whether a value is SQL NULL, whatever its variant.
pub fn is_null(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(None)
            | Value::TinyInt(None)
            | Value::SmallInt(None)
            | Value::Int(None)
            | Value::BigInt(None)
            | Value::TinyUnsigned(None)
            | Value::SmallUnsigned(None)
            | Value::Unsigned(None)
            | Value::BigUnsigned(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::String(None)
            | Value::Char(None)
            | Value::Bytes(None)
            | Value::Json(None)
            | Value::Uuid(None)
            | Value::ChronoDate(None)
            | Value::ChronoTime(None)
            | Value::ChronoDateTime(None)
            | Value::ChronoDateTimeUtc(None)
            | Value::ChronoDateTimeLocal(None)
            | Value::ChronoDateTimeWithTimeZone(None)
    )
}

/// Map key for grouping rows by a join value.
///
/// Integers of different widths normalize to the same key so an `Int` foreign key
/// still matches a `BigInt` primary key.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::TinyInt(Some(i)) => format!("i:{i}"),
        Value::SmallInt(Some(i)) => format!("i:{i}"),
        Value::Int(Some(i)) => format!("i:{i}"),
        Value::BigInt(Some(i)) => format!("i:{i}"),
        Value::TinyUnsigned(Some(u)) => format!("i:{u}"),
        Value::SmallUnsigned(Some(u)) => format!("i:{u}"),
        Value::Unsigned(Some(u)) => format!("i:{u}"),
        Value::BigUnsigned(Some(u)) => format!("i:{u}"),
        Value::String(Some(s)) => format!("s:{s}"),
        Value::Uuid(Some(u)) => format!("u:{}", Uuid::clone(u)),
        other => format!("{other:?}"),
    }
}

/// Encode a JSON or repeated-scalar field.
pub fn to_json_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map(Value::from)
        .map_err(|e| StoreError::query_build(format!("failed to encode JSON field: {e}")))
}

/// One decoded result row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, Value)>,
        C: Into<String>,
    {
        let mut record = Record::new();
        for (column, value) in pairs {
            record.push(column, value);
        }
        record
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.columns.push(column.into());
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Extract a non-null column value.
    pub fn try_get<T: TryGetable>(&self, column: &str) -> Result<T> {
        let value = self.require(column)?;
        T::try_get(value.clone())
            .map_err(|e| StoreError::scan(format!("column {column:?}: {e}")))
    }

    /// Extract a nullable column value.
    pub fn try_get_opt<T: TryGetable>(&self, column: &str) -> Result<Option<T>> {
        let value = self.require(column)?;
        T::try_get_opt(value.clone())
            .map_err(|e| StoreError::scan(format!("column {column:?}: {e}")))
    }

    /// Decode a JSON column (JSON documents and repeated scalars).
    pub fn try_get_json<T: DeserializeOwned>(&self, column: &str) -> Result<T> {
        let json: serde_json::Value = self.try_get(column)?;
        serde_json::from_value(json)
            .map_err(|e| StoreError::scan(format!("column {column:?}: invalid JSON: {e}")))
    }

    fn require(&self, column: &str) -> Result<&Value> {
        self.value(column)
            .ok_or_else(|| StoreError::scan(format!("column {column:?} missing from row")))
    }
}
