//! Conversion between sea-query values and `may_postgres` parameters and rows.
//!
//! Outgoing: every bound [`Value`] becomes a boxed `ToSql`. NULLs keep their
//! variant's type (`Option<i32>`, `Option<String>`, ...) because Postgres checks
//! parameter types even for NULL.
//!
//! Incoming: each column is decoded by its Postgres type into the matching
//! `Value` variant so rows can leave the driver as [`Record`]s.

use crate::error::DriverError;
use crate::value::Record;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use may_postgres::types::{ToSql, Type};
use may_postgres::Row;
use sea_query::Value;
use uuid::Uuid;

type Param = Box<dyn ToSql + Sync>;

fn convert(value: &Value) -> Result<Param, DriverError> {
    let param: Param = match value {
        Value::Bool(v) => Box::new(*v),
        Value::TinyInt(v) => Box::new(v.map(i16::from)),
        Value::SmallInt(v) => Box::new(*v),
        Value::Int(v) => Box::new(*v),
        Value::BigInt(v) => Box::new(*v),
        Value::TinyUnsigned(v) => Box::new(v.map(i16::from)),
        Value::SmallUnsigned(v) => Box::new(v.map(i32::from)),
        Value::Unsigned(v) => Box::new(v.map(i64::from)),
        Value::BigUnsigned(Some(u)) => {
            let signed = i64::try_from(*u).map_err(|_| {
                DriverError::Conversion(format!(
                    "BigUnsigned value {} exceeds i64::MAX ({}), cannot be safely cast to i64",
                    u,
                    i64::MAX
                ))
            })?;
            Box::new(Some(signed))
        }
        Value::BigUnsigned(None) => Box::new(None::<i64>),
        Value::Float(v) => Box::new(*v),
        Value::Double(v) => Box::new(*v),
        Value::String(v) => Box::new(v.as_ref().map(|s| s.to_string())),
        Value::Char(v) => Box::new(v.map(|c| c.to_string())),
        Value::Bytes(v) => Box::new(v.as_ref().map(|b| b.to_vec())),
        Value::Json(v) => Box::new(v.as_ref().map(|j| serde_json::Value::clone(j))),
        Value::Uuid(v) => Box::new(v.as_ref().map(|u| Uuid::clone(u))),
        Value::ChronoDate(v) => Box::new(v.as_ref().map(|d| NaiveDate::clone(d))),
        Value::ChronoTime(v) => Box::new(v.as_ref().map(|t| NaiveTime::clone(t))),
        Value::ChronoDateTime(v) => Box::new(v.as_ref().map(|t| NaiveDateTime::clone(t))),
        Value::ChronoDateTimeUtc(v) => Box::new(v.as_ref().map(|t| DateTime::<Utc>::clone(t))),
        Value::ChronoDateTimeWithTimeZone(v) => Box::new(
            v.as_ref()
                .map(|t| DateTime::<chrono::FixedOffset>::clone(t).with_timezone(&Utc)),
        ),
        _ => {
            return Err(DriverError::Conversion(format!(
                "Unsupported value type in query: {:?}",
                value
            )));
        }
    };
    Ok(param)
}

/// Convert bound values to driver parameters and run `f` with them.
///
/// The boxed parameters live for the duration of the closure, so the
/// `&dyn ToSql` slice handed to the driver stays valid.
pub fn with_converted_params<F, R>(values: &[Value], f: F) -> Result<R, DriverError>
where
    F: FnOnce(&[&dyn ToSql]) -> Result<R, DriverError>,
{
    let boxed = values.iter().map(convert).collect::<Result<Vec<_>, _>>()?;
    let params: Vec<&dyn ToSql> = boxed.iter().map(|p| p.as_ref() as &dyn ToSql).collect();
    f(&params)
}

fn decode_column(row: &Row, index: usize, ty: &Type) -> Result<Value, may_postgres::Error> {
    let value = match *ty {
        Type::BOOL => Value::from(row.try_get::<_, Option<bool>>(index)?),
        Type::INT2 => Value::from(row.try_get::<_, Option<i16>>(index)?),
        Type::INT4 => Value::from(row.try_get::<_, Option<i32>>(index)?),
        Type::INT8 => Value::from(row.try_get::<_, Option<i64>>(index)?),
        Type::FLOAT4 => Value::from(row.try_get::<_, Option<f32>>(index)?),
        Type::FLOAT8 => Value::from(row.try_get::<_, Option<f64>>(index)?),
        Type::BYTEA => Value::from(row.try_get::<_, Option<Vec<u8>>>(index)?),
        Type::JSON | Type::JSONB => {
            Value::from(row.try_get::<_, Option<serde_json::Value>>(index)?)
        }
        Type::UUID => Value::from(row.try_get::<_, Option<Uuid>>(index)?),
        Type::TIMESTAMPTZ => Value::from(row.try_get::<_, Option<DateTime<Utc>>>(index)?),
        Type::TIMESTAMP => Value::from(row.try_get::<_, Option<NaiveDateTime>>(index)?),
        Type::DATE => Value::from(row.try_get::<_, Option<NaiveDate>>(index)?),
        Type::TIME => Value::from(row.try_get::<_, Option<NaiveTime>>(index)?),
        // TEXT, VARCHAR, BPCHAR, NAME and anything else textual
        _ => Value::from(row.try_get::<_, Option<String>>(index)?),
    };
    Ok(value)
}

/// Decode a driver row into a [`Record`].
pub fn record_from_row(row: &Row) -> Result<Record, DriverError> {
    let mut record = Record::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_()).map_err(|e| {
            DriverError::Conversion(format!("column {:?}: {}", column.name(), e))
        })?;
        record.push(column.name(), value);
    }
    Ok(record)
}
