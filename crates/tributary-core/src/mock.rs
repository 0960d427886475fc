//! In-memory change log and target store for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::action::ApplyAction;
use crate::descriptor::LogTableDescriptor;
use crate::error::{Error, Result};
use crate::stats::{OperationStats, ReplicationStatistics};
use crate::store::{ChangeLog, DeadLetter, TargetStore};
use crate::types::{Change, ChangeRecord, RecordId, RowMap, Value};

/// A change log that also simulates the captured source relation.
///
/// The `capture_*` methods play the role of the capture hook: they mutate the
/// simulated source rows and append the matching record in one step.
#[derive(Clone)]
pub struct MemoryChangeLog {
    descriptor: Arc<LogTableDescriptor>,
    state: Arc<Mutex<LogState>>,
}

#[derive(Default)]
struct LogState {
    records: Vec<ChangeRecord>,
    dead_letters: HashMap<u64, DeadLetter>,
    source: BTreeMap<String, RowMap>,
    next_sequence: u64,
}

impl LogState {
    fn append(&mut self, record_id: RecordId, change: Change) -> u64 {
        self.next_sequence += 1;
        self.records.push(ChangeRecord {
            sequence_id: self.next_sequence,
            record_id,
            change,
            captured_at: Utc::now(),
            delivered: false,
            delivered_at: None,
            attempts: 0,
            retry_after: None,
        });
        self.next_sequence
    }
}

impl MemoryChangeLog {
    pub fn new(descriptor: LogTableDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            state: Arc::new(Mutex::new(LogState::default())),
        }
    }

    fn key_value(&self, row: &RowMap) -> Value {
        row.get(self.descriptor.primary_key())
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn record_id(&self, row: &RowMap) -> RecordId {
        RecordId::from_value(&self.key_value(row)).unwrap_or(RecordId::Text(String::new()))
    }

    /// Insert a source row and capture it. Returns the assigned sequence id.
    pub fn capture_insert(&self, row: RowMap) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.source.insert(self.key_value(&row).key_repr(), row.clone());
        state.append(self.record_id(&row), Change::Insert { new_image: row })
    }

    pub fn capture_update(&self, old: RowMap, new: RowMap) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.source.remove(&self.key_value(&old).key_repr());
        state.source.insert(self.key_value(&new).key_repr(), new.clone());
        state.append(
            self.record_id(&new),
            Change::Update {
                old_image: old,
                new_image: new,
            },
        )
    }

    pub fn capture_delete(&self, old: RowMap) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.source.remove(&self.key_value(&old).key_repr());
        state.append(self.record_id(&old), Change::Delete { old_image: old })
    }

    /// Current rows of the simulated source relation, by key.
    pub fn source_rows(&self) -> BTreeMap<String, RowMap> {
        self.state.lock().unwrap().source.clone()
    }

    /// Every record, delivered or not, in sequence order.
    pub fn all_records(&self) -> Vec<ChangeRecord> {
        self.state.lock().unwrap().records.clone()
    }

    /// Flip records back to undelivered, as if marking them had never
    /// happened.
    pub fn reset_delivery(&self, ids: impl IntoIterator<Item = u64>) {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some(record) = state.records.iter_mut().find(|r| r.sequence_id == id) {
                record.delivered = false;
                record.delivered_at = None;
            }
        }
    }
}

impl ChangeLog for MemoryChangeLog {
    fn relation(&self) -> &str {
        self.descriptor.relation()
    }

    fn pending_changes(&self, limit: Option<usize>) -> Result<Vec<ChangeRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .iter()
            .filter(|r| !r.delivered && !state.dead_letters.contains_key(&r.sequence_id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn mark_delivered(&self, ids: &[u64]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut count = 0;
        for record in state.records.iter_mut() {
            if !record.delivered && ids.contains(&record.sequence_id) {
                record.delivered = true;
                record.delivered_at = Some(now);
                record.attempts = 0;
                record.retry_after = None;
                count += 1;
            }
        }
        Ok(count)
    }

    fn statistics(&self) -> Result<ReplicationStatistics> {
        let state = self.state.lock().unwrap();
        let mut stats: BTreeMap<_, OperationStats> = BTreeMap::new();
        for record in &state.records {
            let entry = stats.entry(record.operation()).or_default();
            entry.total += 1;
            if record.delivered {
                entry.delivered += 1;
            } else if state.dead_letters.contains_key(&record.sequence_id) {
                entry.dead_lettered += 1;
            } else {
                entry.pending += 1;
            }
        }
        Ok(stats.into_iter().collect())
    }

    fn record_failure(
        &self,
        id: u64,
        attempts: u32,
        _error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.iter_mut().find(|r| r.sequence_id == id) {
            record.attempts = attempts;
            record.retry_after = Some(retry_after);
        }
        Ok(())
    }

    fn dead_letter(&self, id: u64, attempts: u32, error: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .iter()
            .find(|r| r.sequence_id == id)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("no change record {}", id)))?;
        state.dead_letters.insert(
            id,
            DeadLetter {
                sequence_id: id,
                operation: record.operation(),
                record_id: record.record_id,
                attempts,
                error_message: error.to_string(),
                dead_lettered_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.dead_lettered_at
                .cmp(&a.dead_lettered_at)
                .then(b.sequence_id.cmp(&a.sequence_id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    fn requeue_dead_letter(&self, id: u64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let removed = state.dead_letters.remove(&id).is_some();
        if removed {
            if let Some(record) = state.records.iter_mut().find(|r| r.sequence_id == id) {
                record.attempts = 0;
                record.retry_after = None;
            }
        }
        Ok(removed)
    }

    fn requeue_all_dead_letters(&self) -> Result<usize> {
        let ids: Vec<u64> = self.state.lock().unwrap().dead_letters.keys().copied().collect();
        for id in &ids {
            self.requeue_dead_letter(*id)?;
        }
        Ok(ids.len())
    }
}

/// A target store that keeps rows in memory and can simulate failures.
#[derive(Clone)]
pub struct MockTarget {
    key_column: Arc<str>,
    state: Arc<Mutex<TargetState>>,
}

#[derive(Default)]
struct TargetState {
    rows: BTreeMap<String, RowMap>,
    /// Remaining injected failures, by key.
    fail_on: HashMap<String, usize>,
    disconnected: bool,
    applied: usize,
    commits: usize,
}

impl MockTarget {
    pub fn new(key_column: &str) -> Self {
        Self {
            key_column: Arc::from(key_column),
            state: Arc::new(Mutex::new(TargetState::default())),
        }
    }

    /// Fail the next `times` writes that touch `key`.
    pub fn fail_on(&self, key: impl Into<Value>, times: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_on.insert(key.into().key_repr(), times);
    }

    /// Make every call fail as if the target were unreachable.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().disconnected = true;
    }

    pub fn reconnect(&self) {
        self.state.lock().unwrap().disconnected = false;
    }

    pub fn get(&self, key: &Value) -> Option<RowMap> {
        self.state.lock().unwrap().rows.get(&key.key_repr()).cloned()
    }

    pub fn rows(&self) -> BTreeMap<String, RowMap> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    /// Successful `apply` calls so far.
    pub fn applied(&self) -> usize {
        self.state.lock().unwrap().applied
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }
}

impl TargetStore for MockTarget {
    fn apply(&self, action: &ApplyAction) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.disconnected {
            return Err(Error::Connection("mock target disconnected".into()));
        }

        let key = action.key().key_repr();
        if let Some(remaining) = state.fail_on.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Storage(format!(
                    "injected failure for {}={}",
                    self.key_column, key
                )));
            }
        }

        match action {
            ApplyAction::Upsert { row, .. } => {
                state.rows.insert(key, row.clone());
            }
            ApplyAction::Update { row, .. } => {
                let merged = match state.rows.get(&key) {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        for (column, value) in row {
                            if column.as_str() != &*self.key_column {
                                merged.insert(column.clone(), value.clone());
                            }
                        }
                        merged
                    }
                    None => row.clone(),
                };
                state.rows.insert(key, merged);
            }
            ApplyAction::Replace { old_key, row, .. } => {
                state.rows.remove(&old_key.key_repr());
                state.rows.insert(key, row.clone());
            }
            ApplyAction::Delete { .. } => {
                state.rows.remove(&key);
            }
        }

        state.applied += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(Error::Connection("mock target disconnected".into()));
        }
        state.commits += 1;
        Ok(())
    }
}
