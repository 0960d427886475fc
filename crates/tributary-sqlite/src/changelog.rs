use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use tributary_core::{
    parse_image, Change, ChangeLog, ChangeRecord, DeadLetter, Error, LogTableDescriptor,
    Operation, OperationStats, ReplicationStatistics, Result,
};

use crate::database::{table_exists, SqliteDatabase};
use crate::error::SqliteResult;
use crate::schema::quote;
use crate::value::{format_timestamp, parse_timestamp, record_id_from_sql};

/// Reads and updates delivery state of one relation's change log.
///
/// Only ever touches the log, retry and dead-letter tables; the captured
/// relation itself is never read.
#[derive(Clone)]
pub struct SqliteChangeLog {
    db: SqliteDatabase,
    descriptor: LogTableDescriptor,
    log: String,
    retry: String,
    dlq: String,
}

impl SqliteChangeLog {
    /// Open the change log of a captured relation.
    ///
    /// Fails with [`Error::NotCaptured`] when the log table does not exist.
    pub fn open(db: SqliteDatabase, descriptor: LogTableDescriptor) -> Result<Self> {
        let exists = db.with_conn(|conn| {
            Ok(table_exists(conn, &descriptor.log_table())?
                && table_exists(conn, &descriptor.retry_table())?
                && table_exists(conn, &descriptor.dead_letter_table())?)
        })?;
        if !exists {
            return Err(Error::NotCaptured(descriptor.relation().to_string()));
        }

        Ok(Self {
            log: quote(&descriptor.log_table()),
            retry: quote(&descriptor.retry_table()),
            dlq: quote(&descriptor.dead_letter_table()),
            db,
            descriptor,
        })
    }

    pub fn descriptor(&self) -> &LogTableDescriptor {
        &self.descriptor
    }

    /// Every record, delivered or not, in sequence order.
    pub fn all_changes(&self, limit: Option<usize>) -> Result<Vec<ChangeRecord>> {
        Ok(self.db.with_conn(|conn| self.select(conn, false, limit))?)
    }

    fn select(
        &self,
        conn: &Connection,
        pending_only: bool,
        limit: Option<usize>,
    ) -> SqliteResult<Vec<ChangeRecord>> {
        let filter = if pending_only {
            format!(
                "WHERE c.delivered = 0
                   AND NOT EXISTS (SELECT 1 FROM {} d WHERE d.sequence_id = c.sequence_id)",
                self.dlq
            )
        } else {
            String::new()
        };

        let sql = format!(
            "SELECT c.sequence_id, c.operation, c.record_id, c.old_data, c.new_data,
                    c.changed_at, c.delivered, c.delivered_at,
                    COALESCE(r.attempts, 0), r.retry_after
             FROM {log} c
             LEFT JOIN {retry} r ON r.sequence_id = c.sequence_id
             {filter}
             ORDER BY c.sequence_id
             LIMIT ?1",
            log = self.log,
            retry = self.retry,
            filter = filter,
        );

        let limit = limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([limit], |row| {
            Ok(RawRecord {
                sequence_id: row.get(0)?,
                operation: row.get(1)?,
                record_id: record_id_from_sql(row.get_ref(2)?),
                old_data: row.get(3)?,
                new_data: row.get(4)?,
                changed_at: row.get(5)?,
                delivered: row.get::<_, i64>(6)? != 0,
                delivered_at: row.get(7)?,
                attempts: row.get(8)?,
                retry_after: row.get(9)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.decode()?);
        }
        Ok(records)
    }
}

/// A change log row before its JSON images and timestamps are decoded.
struct RawRecord {
    sequence_id: i64,
    operation: String,
    record_id: SqliteResult<tributary_core::RecordId>,
    old_data: Option<String>,
    new_data: Option<String>,
    changed_at: String,
    delivered: bool,
    delivered_at: Option<String>,
    attempts: i64,
    retry_after: Option<String>,
}

impl RawRecord {
    fn decode(self) -> SqliteResult<ChangeRecord> {
        let operation = Operation::from_str(&self.operation)?;
        let old_image = self.old_data.as_deref().map(parse_image).transpose()?;
        let new_image = self.new_data.as_deref().map(parse_image).transpose()?;

        Ok(ChangeRecord {
            sequence_id: self.sequence_id as u64,
            record_id: self.record_id?,
            change: Change::from_parts(operation, old_image, new_image)?,
            captured_at: parse_timestamp(&self.changed_at)?,
            delivered: self.delivered,
            delivered_at: self.delivered_at.as_deref().map(parse_timestamp).transpose()?,
            attempts: self.attempts as u32,
            retry_after: self.retry_after.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

impl ChangeLog for SqliteChangeLog {
    fn relation(&self) -> &str {
        self.descriptor.relation()
    }

    fn pending_changes(&self, limit: Option<usize>) -> Result<Vec<ChangeRecord>> {
        let records = self.db.with_conn(|conn| self.select(conn, true, limit))?;
        debug!(
            relation = self.relation(),
            count = records.len(),
            "Fetched pending changes"
        );
        Ok(records)
    }

    fn mark_delivered(&self, ids: &[u64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = format_timestamp(Utc::now());
        let marked = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut marked = 0;
            {
                let mut mark = tx.prepare_cached(&format!(
                    "UPDATE {} SET delivered = 1, delivered_at = ?1
                     WHERE sequence_id = ?2 AND delivered = 0",
                    self.log
                ))?;
                let mut clear = tx.prepare_cached(&format!(
                    "DELETE FROM {} WHERE sequence_id = ?1",
                    self.retry
                ))?;
                for id in ids {
                    let id = *id as i64;
                    marked += mark.execute(rusqlite::params![now, id])?;
                    clear.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(marked)
        })?;

        debug!(relation = self.relation(), marked, "Marked changes delivered");
        Ok(marked)
    }

    fn statistics(&self) -> Result<ReplicationStatistics> {
        let sql = format!(
            "SELECT c.operation,
                    COUNT(*),
                    SUM(CASE WHEN c.delivered = 0 AND d.sequence_id IS NULL THEN 1 ELSE 0 END),
                    SUM(CASE WHEN c.delivered = 1 THEN 1 ELSE 0 END),
                    SUM(CASE WHEN c.delivered = 0 AND d.sequence_id IS NOT NULL THEN 1 ELSE 0 END)
             FROM {} c
             LEFT JOIN {} d ON d.sequence_id = c.sequence_id
             GROUP BY c.operation",
            self.log, self.dlq
        );

        Ok(self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    OperationStats {
                        total: row.get::<_, i64>(1)? as u64,
                        pending: row.get::<_, i64>(2)? as u64,
                        delivered: row.get::<_, i64>(3)? as u64,
                        dead_lettered: row.get::<_, i64>(4)? as u64,
                    },
                ))
            })?;

            let mut stats = ReplicationStatistics::new();
            for row in rows {
                let (op, counts) = row?;
                stats.insert(Operation::from_str(&op)?, counts);
            }
            Ok(stats)
        })?)
    }

    fn record_failure(
        &self,
        id: u64,
        attempts: u32,
        error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (sequence_id, attempts, last_error, retry_after, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(sequence_id) DO UPDATE SET
                        attempts = excluded.attempts,
                        last_error = excluded.last_error,
                        retry_after = excluded.retry_after,
                        updated_at = excluded.updated_at",
                    self.retry
                ),
                rusqlite::params![
                    id as i64,
                    attempts,
                    error,
                    format_timestamp(retry_after),
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    fn dead_letter(&self, id: u64, attempts: u32, error: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (sequence_id, attempts, error_message, dead_lettered_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    self.dlq
                ),
                rusqlite::params![id as i64, attempts, error, format_timestamp(Utc::now())],
            )?;
            tx.execute(
                &format!("DELETE FROM {} WHERE sequence_id = ?1", self.retry),
                [id as i64],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let sql = format!(
            "SELECT d.sequence_id, c.operation, c.record_id, d.attempts, d.error_message,
                    d.dead_lettered_at
             FROM {} d
             JOIN {} c ON c.sequence_id = d.sequence_id
             ORDER BY d.dead_lettered_at DESC, d.sequence_id DESC
             LIMIT ?1",
            self.dlq, self.log
        );

        Ok(self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([limit.min(i64::MAX as usize) as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    record_id_from_sql(row.get_ref(2)?),
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (sequence_id, operation, record_id, attempts, error_message, at) = row?;
                entries.push(DeadLetter {
                    sequence_id: sequence_id as u64,
                    operation: Operation::from_str(&operation)?,
                    record_id: record_id?,
                    attempts,
                    error_message,
                    dead_lettered_at: parse_timestamp(&at)?,
                });
            }
            Ok(entries)
        })?)
    }

    fn requeue_dead_letter(&self, id: u64) -> Result<bool> {
        Ok(self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                &format!("DELETE FROM {} WHERE sequence_id = ?1", self.dlq),
                [id as i64],
            )?;
            tx.execute(
                &format!("DELETE FROM {} WHERE sequence_id = ?1", self.retry),
                [id as i64],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })?)
    }

    fn requeue_all_dead_letters(&self) -> Result<usize> {
        Ok(self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE sequence_id IN (SELECT sequence_id FROM {})",
                    self.retry, self.dlq
                ),
                [],
            )?;
            let removed = tx.execute(&format!("DELETE FROM {}", self.dlq), [])?;
            tx.commit()?;
            Ok(removed)
        })?)
    }
}
