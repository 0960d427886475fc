use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A column value captured from a source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical string form when the value is used as a row key, so `1` and
    /// `"1"` stay distinct.
    pub fn key_repr(&self) -> String {
        match self {
            Value::String(s) => format!("s:{}", s),
            other => format!("v:{}", serde_json::Value::from(other.clone())),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A row image: column name to value.
pub type RowMap = HashMap<String, Value>;

/// Parse a serialized row image (a JSON object) into a [`RowMap`].
pub fn parse_image(json: &str) -> Result<RowMap> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
    Ok(parsed.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
}

/// The kind of mutation that produced a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Insert, Operation::Update, Operation::Delete];

    /// The tag stored in the change log's `operation` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(Error::Storage(format!("unknown operation tag '{}'", other))),
        }
    }
}

/// Identifier of the mutated source row (the primary-key value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Build a record id from a primary-key column value.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(RecordId::Int(*i)),
            Value::String(s) => Ok(RecordId::Text(s.clone())),
            other => Err(Error::InvalidDescriptor(format!(
                "primary key value must be an integer or text, got {:?}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(i) => Value::Int(*i),
            RecordId::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(i) => write!(f, "{}", i),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(v: i64) -> Self {
        RecordId::Int(v)
    }
}

impl From<&str> for RecordId {
    fn from(v: &str) -> Self {
        RecordId::Text(v.to_string())
    }
}

/// The captured mutation, with exactly the images its operation carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum Change {
    Insert { new_image: RowMap },
    Update { old_image: RowMap, new_image: RowMap },
    Delete { old_image: RowMap },
}

impl Change {
    /// Rebuild a change from its stored columns, rejecting images that do not
    /// fit the operation.
    pub fn from_parts(
        operation: Operation,
        old_image: Option<RowMap>,
        new_image: Option<RowMap>,
    ) -> Result<Self> {
        match (operation, old_image, new_image) {
            (Operation::Insert, None, Some(new_image)) => Ok(Change::Insert { new_image }),
            (Operation::Update, Some(old_image), Some(new_image)) => {
                Ok(Change::Update { old_image, new_image })
            }
            (Operation::Delete, Some(old_image), None) => Ok(Change::Delete { old_image }),
            (op, old, new) => Err(Error::Storage(format!(
                "{} record with old_data={} new_data={}",
                op,
                if old.is_some() { "present" } else { "null" },
                if new.is_some() { "present" } else { "null" },
            ))),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Change::Insert { .. } => Operation::Insert,
            Change::Update { .. } => Operation::Update,
            Change::Delete { .. } => Operation::Delete,
        }
    }

    /// The pre-mutation image (update and delete).
    pub fn old_image(&self) -> Option<&RowMap> {
        match self {
            Change::Insert { .. } => None,
            Change::Update { old_image, .. } | Change::Delete { old_image } => Some(old_image),
        }
    }

    /// The post-mutation image (insert and update).
    pub fn new_image(&self) -> Option<&RowMap> {
        match self {
            Change::Insert { new_image } | Change::Update { new_image, .. } => Some(new_image),
            Change::Delete { .. } => None,
        }
    }
}

/// One captured mutation as stored in a change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the log; strictly increasing, never reused.
    pub sequence_id: u64,
    /// Primary-key value of the mutated row.
    pub record_id: RecordId,
    /// The mutation and its row images.
    pub change: Change,
    /// When the capture hook appended the record.
    pub captured_at: DateTime<Utc>,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Failed apply attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Earliest time the record may be retried after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn operation(&self) -> Operation {
        self.change.operation()
    }

    pub fn get_old(&self, column: &str) -> Option<&Value> {
        self.change.old_image().and_then(|row| row.get(column))
    }

    pub fn get_new(&self, column: &str) -> Option<&Value> {
        self.change.new_image().and_then(|row| row.get(column))
    }

    /// Whether the record may be applied at `now` (not waiting out a backoff).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |at| at <= now)
    }
}
