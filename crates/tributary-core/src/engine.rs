use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::descriptor::LogTableDescriptor;
use crate::error::{Error, Result};
use crate::planner::plan;
use crate::retry::RetryPolicy;
use crate::store::{ChangeLog, TargetStore};
use crate::action::ApplyAction;
use crate::types::ChangeRecord;

/// Tuning for the apply loop.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Records fetched per cycle.
    pub batch_size: usize,
    /// Wall-clock budget for one cycle; records not reached stay pending.
    pub max_batch_duration: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batch_duration: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }
}

/// What one replicate cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationOutcome {
    /// Pending records read from the log.
    pub fetched: usize,
    /// Records applied and marked delivered.
    pub applied: usize,
    /// Records that failed and will be retried.
    pub failed: usize,
    /// Records skipped because their backoff has not elapsed.
    pub deferred: usize,
    /// Records parked after exhausting their retries.
    pub dead_lettered: usize,
    /// Records left pending because an earlier record for the same key did
    /// not succeed in this cycle.
    pub held_back: usize,
    /// The wall-clock budget ran out before the batch was finished.
    pub budget_exhausted: bool,
}

/// Drains one relation's change log into one target, in sequence order.
///
/// A record is never applied ahead of an earlier record for the same key that
/// has not succeeded: once a record fails or is deferred, every later record
/// in the batch touching one of its keys is held back and stays pending.
///
/// Delivery is at-least-once: the target is committed before the log is
/// marked, so a crash in between replays records on the next cycle. Every
/// target write is keyed and idempotent, which makes the replay harmless.
///
/// Cycles are serialized per engine, so an engine must be the only one
/// draining its (source, target) pair.
pub struct ReplicationEngine<L, T> {
    descriptor: LogTableDescriptor,
    log: L,
    target: T,
    config: ReplicationConfig,
    in_flight: Mutex<()>,
}

impl<L: ChangeLog, T: TargetStore> ReplicationEngine<L, T> {
    pub fn new(descriptor: LogTableDescriptor, log: L, target: T) -> Self {
        Self {
            descriptor,
            log,
            target,
            config: ReplicationConfig::default(),
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: ReplicationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Apply up to `batch_size` pending records and return how many were
    /// delivered. Returns 0 without touching the target when nothing is
    /// pending.
    pub fn replicate(&self, batch_size: usize) -> Result<usize> {
        Ok(self.replicate_batch(batch_size)?.applied)
    }

    /// One cycle using the configured batch size.
    pub fn run_cycle(&self) -> Result<ReplicationOutcome> {
        self.replicate_batch(self.config.batch_size)
    }

    /// Run cycles until one delivers nothing. Returns the total delivered.
    ///
    /// Stops early on records that keep failing, since those cycles deliver
    /// nothing.
    pub fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let applied = self.replicate(self.config.batch_size)?;
            if applied == 0 {
                return Ok(total);
            }
            total += applied;
        }
    }

    /// One cycle with full accounting.
    pub fn replicate_batch(&self, batch_size: usize) -> Result<ReplicationOutcome> {
        let _guard = self
            .in_flight
            .lock()
            .map_err(|_| Error::Connection("replication lock poisoned".into()))?;

        let records = self.log.pending_changes(Some(batch_size))?;
        let mut outcome = ReplicationOutcome {
            fetched: records.len(),
            ..Default::default()
        };

        if records.is_empty() {
            debug!(relation = self.log.relation(), "No pending changes to replicate");
            return Ok(outcome);
        }

        debug!(
            relation = self.log.relation(),
            count = records.len(),
            first = records[0].sequence_id,
            "Replicating batch"
        );

        let started = Instant::now();
        let now = Utc::now();
        let mut delivered: Vec<u64> = Vec::with_capacity(records.len());
        let mut failures: Vec<(&ChangeRecord, String)> = Vec::new();
        let mut blocked: HashSet<String> = HashSet::new();

        for record in &records {
            if let Some(budget) = self.config.max_batch_duration {
                if started.elapsed() >= budget {
                    outcome.budget_exhausted = true;
                    warn!(
                        relation = self.log.relation(),
                        budget_ms = budget.as_millis() as u64,
                        remaining = records.len()
                            - delivered.len()
                            - failures.len()
                            - outcome.deferred
                            - outcome.held_back,
                        "Batch budget exhausted, leaving remaining records pending"
                    );
                    break;
                }
            }

            let planned = self.plan(record);
            let keys = touched_keys(record, planned.as_ref().ok());

            if keys.iter().any(|k| blocked.contains(k)) {
                debug!(
                    relation = self.log.relation(),
                    sequence_id = record.sequence_id,
                    record_id = %record.record_id,
                    "Holding back change behind an unfinished change for the same key"
                );
                outcome.held_back += 1;
                continue;
            }

            if !record.is_ready(now) {
                outcome.deferred += 1;
                blocked.extend(keys);
                continue;
            }

            match planned.and_then(|action| self.target.apply(&action)) {
                Ok(()) => delivered.push(record.sequence_id),
                Err(e) if e.is_fatal() => {
                    error!(
                        relation = self.log.relation(),
                        sequence_id = record.sequence_id,
                        error = %e,
                        "Target unavailable, aborting batch"
                    );
                    if let Err(rollback_err) = self.target.rollback() {
                        warn!(error = %rollback_err, "Failed to roll back target");
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        relation = self.log.relation(),
                        sequence_id = record.sequence_id,
                        operation = %record.operation(),
                        record_id = %record.record_id,
                        attempt = record.attempts + 1,
                        error = %e,
                        "Failed to apply change"
                    );
                    failures.push((record, e.to_string()));
                    blocked.extend(keys);
                }
            }
        }

        // Target first: a crash before marking only causes a replay.
        self.target.commit()?;
        if !delivered.is_empty() {
            self.log.mark_delivered(&delivered)?;
        }
        outcome.applied = delivered.len();

        for (record, message) in failures {
            let attempts = record.attempts + 1;
            if self.config.retry.is_exhausted(attempts) {
                self.log.dead_letter(record.sequence_id, attempts, &message)?;
                outcome.dead_lettered += 1;
                error!(
                    relation = self.log.relation(),
                    sequence_id = record.sequence_id,
                    attempts,
                    "Change exhausted its retries, moved to dead letter queue"
                );
            } else {
                let retry_after = self.config.retry.retry_after(attempts, now);
                self.log
                    .record_failure(record.sequence_id, attempts, &message, retry_after)?;
                outcome.failed += 1;
            }
        }

        info!(
            relation = self.log.relation(),
            applied = outcome.applied,
            failed = outcome.failed,
            deferred = outcome.deferred,
            dead_lettered = outcome.dead_lettered,
            held_back = outcome.held_back,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Replicated batch"
        );

        Ok(outcome)
    }

    fn plan(&self, record: &ChangeRecord) -> Result<ApplyAction> {
        plan(record, self.descriptor.primary_key()).map_err(|e| Error::Apply {
            sequence_id: record.sequence_id,
            message: e.to_string(),
        })
    }
}

/// Keys a record touches on the target: its record id plus every key of its
/// planned action (both sides of a key change).
fn touched_keys(record: &ChangeRecord, action: Option<&ApplyAction>) -> Vec<String> {
    let mut keys = vec![record.record_id.to_value().key_repr()];
    if let Some(action) = action {
        keys.extend(action.keys().into_iter().map(|k| k.key_repr()));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryChangeLog, MockTarget};
    use crate::types::{Operation, Value};

    fn descriptor() -> LogTableDescriptor {
        LogTableDescriptor::new("items", vec!["id".into(), "name".into(), "value".into()])
            .unwrap()
    }

    fn item(id: i64, name: &str, value: i64) -> crate::RowMap {
        [
            ("id".to_string(), Value::Int(id)),
            ("name".to_string(), Value::String(name.into())),
            ("value".to_string(), Value::Int(value)),
        ]
        .into_iter()
        .collect()
    }

    fn engine(
        config: ReplicationConfig,
    ) -> (
        ReplicationEngine<MemoryChangeLog, MockTarget>,
        MemoryChangeLog,
        MockTarget,
    ) {
        let log = MemoryChangeLog::new(descriptor());
        let target = MockTarget::new("id");
        let engine =
            ReplicationEngine::new(descriptor(), log.clone(), target.clone()).with_config(config);
        (engine, log, target)
    }

    fn immediate() -> ReplicationConfig {
        ReplicationConfig {
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_replicate_empty_log_does_nothing() {
        let (engine, _log, target) = engine(immediate());
        assert_eq!(engine.replicate(100).unwrap(), 0);
        assert_eq!(target.commits(), 0);
    }

    #[test]
    fn test_inserts_then_update() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 10));
        log.capture_insert(item(2, "b", 20));

        assert_eq!(engine.replicate(10).unwrap(), 2);
        assert_eq!(target.row_count(), 2);

        log.capture_update(item(1, "a", 10), item(1, "a", 99));
        assert_eq!(engine.replicate(10).unwrap(), 1);
        assert_eq!(
            target.get(&Value::Int(1)).unwrap().get("value"),
            Some(&Value::Int(99))
        );
        assert!(log.pending_changes(None).unwrap().is_empty());
    }

    #[test]
    fn test_batch_size_bounds_cycle() {
        let (engine, log, _target) = engine(immediate());
        for i in 0..5 {
            log.capture_insert(item(i, "x", i));
        }

        assert_eq!(engine.replicate(2).unwrap(), 2);
        assert_eq!(engine.replicate(2).unwrap(), 2);
        assert_eq!(engine.replicate(2).unwrap(), 1);
        assert_eq!(engine.replicate(2).unwrap(), 0);
    }

    #[test]
    fn test_failed_record_stays_pending_and_is_retried_first() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 1));
        log.capture_insert(item(2, "b", 2));
        log.capture_insert(item(3, "c", 3));
        target.fail_on(2, 1);

        assert_eq!(engine.replicate(3).unwrap(), 2);

        let pending = log.pending_changes(None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id.to_string(), "2");
        assert_eq!(pending[0].attempts, 1);

        log.capture_insert(item(4, "d", 4));
        let pending = log.pending_changes(None).unwrap();
        assert_eq!(pending[0].record_id.to_string(), "2");

        let outcome = engine.replicate_batch(1).unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(target.get(&Value::Int(2)).is_some());
        assert!(target.get(&Value::Int(4)).is_none());
    }

    #[test]
    fn test_exhausted_record_is_dead_lettered() {
        let (engine, log, target) = engine(ReplicationConfig {
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        });
        log.capture_insert(item(1, "a", 1));
        target.fail_on(1, usize::MAX);

        let first = engine.replicate_batch(10).unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.dead_lettered, 0);

        let second = engine.replicate_batch(10).unwrap();
        assert_eq!(second.dead_lettered, 1);
        assert!(log.pending_changes(None).unwrap().is_empty());

        let parked = log.dead_letters(10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempts, 2);
        assert_eq!(parked[0].operation, Operation::Insert);

        let stats = log.statistics().unwrap().totals();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[test]
    fn test_failed_insert_holds_back_later_update() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 10));
        log.capture_update(item(1, "a", 10), item(1, "b", 99));
        log.capture_insert(item(2, "c", 20));
        target.fail_on(1, 1);

        let outcome = engine.replicate_batch(10).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.held_back, 1);
        assert!(target.get(&Value::Int(1)).is_none());

        let pending = log.pending_changes(None).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[1].attempts, 0);

        assert_eq!(engine.drain().unwrap(), 2);
        assert_eq!(
            target.get(&Value::Int(1)).unwrap().get("name"),
            Some(&Value::String("b".into()))
        );
        assert_eq!(target.rows(), log.source_rows());
    }

    #[test]
    fn test_failed_insert_does_not_resurrect_deleted_row() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 10));
        log.capture_delete(item(1, "a", 10));
        target.fail_on(1, 1);

        let outcome = engine.replicate_batch(10).unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.held_back, 1);

        engine.drain().unwrap();
        assert!(target.get(&Value::Int(1)).is_none());
        assert_eq!(target.rows(), log.source_rows());
    }

    #[test]
    fn test_key_change_holds_back_both_keys() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 10));
        log.capture_update(item(1, "a", 10), item(2, "a", 10));
        log.capture_insert(item(1, "again", 11));
        log.capture_update(item(2, "a", 10), item(2, "z", 12));
        target.fail_on(2, 1);

        let outcome = engine.replicate_batch(10).unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.held_back, 2);

        engine.drain().unwrap();
        assert_eq!(target.rows(), log.source_rows());
    }

    #[test]
    fn test_deferred_record_holds_back_same_key() {
        let (engine, log, target) = engine(ReplicationConfig {
            retry: RetryPolicy::new(3, Duration::from_secs(3600)),
            ..Default::default()
        });
        log.capture_insert(item(1, "a", 1));
        target.fail_on(1, 1);
        assert_eq!(engine.replicate_batch(10).unwrap().failed, 1);

        log.capture_delete(item(1, "a", 1));
        log.capture_insert(item(2, "b", 2));

        let outcome = engine.replicate_batch(10).unwrap();
        assert_eq!(outcome.deferred, 1);
        assert_eq!(outcome.held_back, 1);
        assert_eq!(outcome.applied, 1);
        assert_eq!(log.pending_changes(None).unwrap().len(), 2);
    }

    #[test]
    fn test_backoff_defers_record() {
        let (engine, log, target) = engine(ReplicationConfig {
            retry: RetryPolicy::new(3, Duration::from_secs(3600)),
            ..Default::default()
        });
        log.capture_insert(item(1, "a", 1));
        target.fail_on(1, 1);

        assert_eq!(engine.replicate_batch(10).unwrap().failed, 1);

        let outcome = engine.replicate_batch(10).unwrap();
        assert_eq!(outcome.deferred, 1);
        assert_eq!(outcome.applied, 0);
        assert_eq!(log.pending_changes(None).unwrap().len(), 1);
    }

    #[test]
    fn test_connection_error_aborts_without_marking() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 1));
        target.disconnect();

        assert!(matches!(engine.replicate(10), Err(Error::Connection(_))));
        assert_eq!(log.pending_changes(None).unwrap().len(), 1);
        assert_eq!(log.pending_changes(None).unwrap()[0].attempts, 0);
    }

    #[test]
    fn test_exhausted_budget_leaves_records_pending() {
        let (engine, log, _target) = engine(ReplicationConfig {
            max_batch_duration: Some(Duration::ZERO),
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        });
        log.capture_insert(item(1, "a", 1));

        let outcome = engine.replicate_batch(10).unwrap();
        assert!(outcome.budget_exhausted);
        assert_eq!(outcome.applied, 0);
        assert_eq!(log.pending_changes(None).unwrap().len(), 1);
    }

    #[test]
    fn test_drain_converges_target() {
        let (engine, log, target) = engine(ReplicationConfig {
            batch_size: 3,
            ..immediate()
        });
        for i in 0..10 {
            log.capture_insert(item(i, "row", i));
        }
        for i in 0..5 {
            log.capture_update(item(i, "row", i), item(i, "changed", i * 10));
        }
        for i in 5..8 {
            log.capture_delete(item(i, "row", i));
        }

        assert_eq!(engine.drain().unwrap(), 18);
        assert_eq!(target.rows(), log.source_rows());
    }

    #[test]
    fn test_replayed_batch_is_idempotent() {
        let (engine, log, target) = engine(immediate());
        log.capture_insert(item(1, "a", 1));
        log.capture_delete(item(1, "a", 1));
        log.capture_insert(item(1, "a", 2));

        let pending = log.pending_changes(None).unwrap();
        engine.replicate(10).unwrap();

        // Simulate a crash between commit and mark: re-offer the same records.
        log.reset_delivery(pending.iter().map(|r| r.sequence_id));
        assert_eq!(engine.replicate(10).unwrap(), 3);
        assert_eq!(target.row_count(), 1);
        assert_eq!(
            target.get(&Value::Int(1)).unwrap().get("value"),
            Some(&Value::Int(2))
        );
    }
}
