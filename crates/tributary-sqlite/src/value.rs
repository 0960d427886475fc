//! Conversions between captured values and SQLite storage classes.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};

use tributary_core::{RecordId, Value};

use crate::error::{SqliteError, SqliteResult};

/// Bind a captured value. Booleans become integers and nested values are
/// stored as JSON text, matching what `json_object` produced on capture.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        nested @ (Value::Array(_) | Value::Object(_)) => {
            SqlValue::Text(serde_json::Value::from(nested.clone()).to_string())
        }
    }
}

pub fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::Int(*byte as i64)).collect()),
    }
}

/// Read the `record_id` column of a change log row.
pub fn record_id_from_sql(value: ValueRef<'_>) -> SqliteResult<RecordId> {
    match value {
        ValueRef::Integer(i) => Ok(RecordId::Int(i)),
        ValueRef::Text(t) => Ok(RecordId::Text(String::from_utf8_lossy(t).into_owned())),
        ValueRef::Real(f) => Ok(RecordId::Text(f.to_string())),
        other => Err(SqliteError::Serialization(format!(
            "unsupported record_id storage class {:?}",
            other.data_type()
        ))),
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp: RFC 3339, or SQLite's `CURRENT_TIMESTAMP` form
/// which is UTC without an offset.
pub fn parse_timestamp(s: &str) -> SqliteResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| SqliteError::Serialization(format!("invalid timestamp '{}': {}", s, e)))
}
