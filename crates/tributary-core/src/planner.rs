use crate::action::ApplyAction;
use crate::error::{Error, Result};
use crate::types::{Change, ChangeRecord, RowMap, Value};

/// Translate a change record into the keyed target write that reproduces it.
///
/// `key_column` is the relation's primary-key column.
pub fn plan(record: &ChangeRecord, key_column: &str) -> Result<ApplyAction> {
    match &record.change {
        Change::Insert { new_image } => {
            let key = key_of(new_image, key_column)?;
            Ok(ApplyAction::Upsert {
                key,
                row: new_image.clone(),
            })
        }
        Change::Update {
            old_image,
            new_image,
        } => {
            let key = key_of(new_image, key_column)?;
            match old_image.get(key_column) {
                Some(old_key) if !old_key.is_null() && *old_key != key => {
                    Ok(ApplyAction::Replace {
                        old_key: old_key.clone(),
                        key,
                        row: new_image.clone(),
                    })
                }
                _ => Ok(ApplyAction::Update {
                    key,
                    row: new_image.clone(),
                }),
            }
        }
        Change::Delete { .. } => Ok(ApplyAction::Delete {
            key: record.record_id.to_value(),
        }),
    }
}

fn key_of(image: &RowMap, key_column: &str) -> Result<Value> {
    match image.get(key_column) {
        Some(Value::Null) | None => Err(Error::MissingColumn(key_column.to_string())),
        Some(value) => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordId;
    use chrono::Utc;

    fn row(pairs: &[(&str, Value)]) -> RowMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn record(record_id: i64, change: Change) -> ChangeRecord {
        ChangeRecord {
            sequence_id: 1,
            record_id: RecordId::Int(record_id),
            change,
            captured_at: Utc::now(),
            delivered: false,
            delivered_at: None,
            attempts: 0,
            retry_after: None,
        }
    }

    #[test]
    fn test_plan_insert_upserts_new_image() {
        let image = row(&[("id", Value::Int(1)), ("name", "test1".into())]);
        let action = plan(
            &record(1, Change::Insert { new_image: image.clone() }),
            "id",
        )
        .unwrap();
        assert_eq!(action, ApplyAction::upsert(1, image));
    }

    #[test]
    fn test_plan_update_keys_on_new_image() {
        let old = row(&[("id", Value::Int(1)), ("value", Value::Int(100))]);
        let new = row(&[("id", Value::Int(1)), ("value", Value::Int(200))]);
        let action = plan(
            &record(
                1,
                Change::Update {
                    old_image: old,
                    new_image: new.clone(),
                },
            ),
            "id",
        )
        .unwrap();
        assert_eq!(action, ApplyAction::update(1, new));
    }

    #[test]
    fn test_plan_update_with_changed_key_replaces() {
        let old = row(&[("id", Value::Int(1)), ("value", Value::Int(100))]);
        let new = row(&[("id", Value::Int(5)), ("value", Value::Int(100))]);
        let action = plan(
            &record(
                5,
                Change::Update {
                    old_image: old,
                    new_image: new,
                },
            ),
            "id",
        )
        .unwrap();
        match action {
            ApplyAction::Replace { old_key, key, .. } => {
                assert_eq!(old_key, Value::Int(1));
                assert_eq!(key, Value::Int(5));
            }
            other => panic!("Expected Replace, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_delete_uses_record_id() {
        let old = row(&[("id", Value::Int(9))]);
        let action = plan(&record(9, Change::Delete { old_image: old }), "id").unwrap();
        assert_eq!(action, ApplyAction::delete(9));
    }

    #[test]
    fn test_plan_missing_key_column() {
        let image = row(&[("name", "nameless".into())]);
        let err = plan(&record(1, Change::Insert { new_image: image }), "id").unwrap_err();
        assert!(matches!(err, Error::MissingColumn(c) if c == "id"));

        let image = row(&[("id", Value::Null)]);
        assert!(plan(&record(1, Change::Insert { new_image: image }), "id").is_err());
    }
}
