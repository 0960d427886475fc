//! Storage seams: the change log, the capture installer and the target.
//!
//! The replication engine and health monitor only talk to storage through
//! these traits, so they are agnostic to the engine behind them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::ApplyAction;
use crate::descriptor::LogTableDescriptor;
use crate::error::Result;
use crate::stats::ReplicationStatistics;
use crate::types::{ChangeRecord, Operation, RecordId};

/// A record parked after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub sequence_id: u64,
    pub operation: Operation,
    pub record_id: RecordId,
    pub attempts: u32,
    pub error_message: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What [`ChangeCapture::initialize`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// Log objects and hooks were created.
    Installed,
    /// Everything already matched the descriptor.
    Unchanged,
    /// The descriptor changed; hooks were re-created against the existing log.
    Reinstalled,
}

/// Installs the on-mutation hooks that append to a relation's change log.
pub trait ChangeCapture {
    /// Provision the log and install insert/update/delete hooks.
    ///
    /// Idempotent. Any failure is [`crate::Error::CaptureSetup`] and leaves no
    /// partially installed hooks behind.
    fn initialize(&self, descriptor: &LogTableDescriptor) -> Result<CaptureStatus>;

    /// Whether hooks are currently installed for the relation.
    fn is_initialized(&self, relation: &str) -> Result<bool>;

    /// Remove the hooks, keeping the log for audit. Returns false when the
    /// relation was not captured.
    fn teardown(&self, relation: &str) -> Result<bool>;
}

/// Query and delivery-state surface over one relation's change log.
///
/// Implementations never touch the source relation's live rows.
pub trait ChangeLog: Send + Sync {
    /// The captured source relation.
    fn relation(&self) -> &str;

    /// Undelivered, not dead-lettered records in ascending sequence order.
    fn pending_changes(&self, limit: Option<usize>) -> Result<Vec<ChangeRecord>>;

    /// Mark exactly these records delivered. Unknown or already delivered ids
    /// are ignored. Returns how many records transitioned.
    fn mark_delivered(&self, ids: &[u64]) -> Result<usize>;

    /// Per-operation counts over the full log.
    fn statistics(&self) -> Result<ReplicationStatistics>;

    /// Persist the retry state of a record that failed to apply.
    fn record_failure(
        &self,
        id: u64,
        attempts: u32,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()>;

    /// Park a record; it stops appearing in [`ChangeLog::pending_changes`].
    fn dead_letter(&self, id: u64, attempts: u32, error: &str) -> Result<()>;

    /// Most recently parked records first.
    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Return a parked record to the pending set with a fresh retry budget.
    /// Returns false when the id was not dead-lettered.
    fn requeue_dead_letter(&self, id: u64) -> Result<bool>;

    /// Drop every dead-letter entry, returning the records to pending.
    fn requeue_all_dead_letters(&self) -> Result<usize>;
}

/// The store that change records are replicated into.
pub trait TargetStore: Send + Sync {
    /// Apply one keyed write. A failure must leave the target as it was
    /// before the call.
    fn apply(&self, action: &ApplyAction) -> Result<()>;

    /// Durably commit everything applied since the last commit.
    fn commit(&self) -> Result<()>;

    /// Discard everything applied since the last commit, where the store
    /// supports it.
    fn rollback(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: ChangeLog + ?Sized> ChangeLog for Arc<T> {
    fn relation(&self) -> &str {
        (**self).relation()
    }

    fn pending_changes(&self, limit: Option<usize>) -> Result<Vec<ChangeRecord>> {
        (**self).pending_changes(limit)
    }

    fn mark_delivered(&self, ids: &[u64]) -> Result<usize> {
        (**self).mark_delivered(ids)
    }

    fn statistics(&self) -> Result<ReplicationStatistics> {
        (**self).statistics()
    }

    fn record_failure(
        &self,
        id: u64,
        attempts: u32,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()> {
        (**self).record_failure(id, attempts, error, retry_after)
    }

    fn dead_letter(&self, id: u64, attempts: u32, error: &str) -> Result<()> {
        (**self).dead_letter(id, attempts, error)
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        (**self).dead_letters(limit)
    }

    fn requeue_dead_letter(&self, id: u64) -> Result<bool> {
        (**self).requeue_dead_letter(id)
    }

    fn requeue_all_dead_letters(&self) -> Result<usize> {
        (**self).requeue_all_dead_letters()
    }
}

impl<T: TargetStore + ?Sized> TargetStore for Arc<T> {
    fn apply(&self, action: &ApplyAction) -> Result<()> {
        (**self).apply(action)
    }

    fn commit(&self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&self) -> Result<()> {
        (**self).rollback()
    }
}
