use serde::{Deserialize, Serialize};

use crate::types::{RowMap, Value};

/// A keyed write to perform against the target store.
///
/// Every variant is idempotent at the target: replaying an action that was
/// already applied leaves the target unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ApplyAction {
    /// Insert the row, replacing any row with the same key.
    Upsert {
        key: Value,
        row: RowMap,
    },
    /// Set every non-key column of the row with this key; upsert when absent.
    Update {
        key: Value,
        row: RowMap,
    },
    /// The key itself changed: remove the old row and upsert the new one.
    Replace {
        old_key: Value,
        key: Value,
        row: RowMap,
    },
    /// Remove the row with this key, if any.
    Delete {
        key: Value,
    },
}

impl ApplyAction {
    pub fn upsert(key: impl Into<Value>, row: RowMap) -> Self {
        ApplyAction::Upsert {
            key: key.into(),
            row,
        }
    }

    pub fn update(key: impl Into<Value>, row: RowMap) -> Self {
        ApplyAction::Update {
            key: key.into(),
            row,
        }
    }

    pub fn delete(key: impl Into<Value>) -> Self {
        ApplyAction::Delete { key: key.into() }
    }

    /// The key of the row this action leaves behind (or removes).
    pub fn key(&self) -> &Value {
        match self {
            ApplyAction::Upsert { key, .. }
            | ApplyAction::Update { key, .. }
            | ApplyAction::Replace { key, .. }
            | ApplyAction::Delete { key } => key,
        }
    }

    /// Every key this action touches, including the old key of a `Replace`.
    pub fn keys(&self) -> Vec<&Value> {
        match self {
            ApplyAction::Replace { old_key, key, .. } => vec![old_key, key],
            other => vec![other.key()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_keys() {
        let row: RowMap = [("id".into(), Value::Int(42))].into_iter().collect();

        let upsert = ApplyAction::upsert(42, row.clone());
        assert_eq!(upsert.key(), &Value::Int(42));
        assert_eq!(upsert.keys(), vec![&Value::Int(42)]);

        let delete = ApplyAction::delete("abc");
        assert_eq!(delete.key(), &Value::String("abc".into()));

        let replace = ApplyAction::Replace {
            old_key: Value::Int(1),
            key: Value::Int(2),
            row,
        };
        assert_eq!(replace.key(), &Value::Int(2));
        assert_eq!(replace.keys(), vec![&Value::Int(1), &Value::Int(2)]);
    }

    #[test]
    fn test_action_serialization_tag() {
        let json = serde_json::to_value(ApplyAction::delete(1)).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["key"], 1);
    }
}
