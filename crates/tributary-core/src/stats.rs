use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Operation;

/// Delivery counts for one operation kind (or for the whole log).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStats {
    pub total: u64,
    /// Undelivered and not dead-lettered.
    pub pending: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
}

impl OperationStats {
    fn add(&mut self, other: &OperationStats) {
        self.total += other.total;
        self.pending += other.pending;
        self.delivered += other.delivered;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Read-time aggregate over a change log, grouped by operation.
///
/// Operations with no records are absent from the map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationStatistics {
    by_operation: BTreeMap<Operation, OperationStats>,
}

impl ReplicationStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: Operation, stats: OperationStats) {
        self.by_operation.insert(op, stats);
    }

    pub fn get(&self, op: Operation) -> Option<&OperationStats> {
        self.by_operation.get(&op)
    }

    pub fn by_operation(&self) -> &BTreeMap<Operation, OperationStats> {
        &self.by_operation
    }

    /// Sum across all operations.
    pub fn totals(&self) -> OperationStats {
        let mut totals = OperationStats::default();
        for stats in self.by_operation.values() {
            totals.add(stats);
        }
        totals
    }

    pub fn is_empty(&self) -> bool {
        self.by_operation.is_empty()
    }
}

impl FromIterator<(Operation, OperationStats)> for ReplicationStatistics {
    fn from_iter<I: IntoIterator<Item = (Operation, OperationStats)>>(iter: I) -> Self {
        Self {
            by_operation: iter.into_iter().collect(),
        }
    }
}
