use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use tributary_core::{
    CaptureStatus, ChangeCapture, Error, LogTableDescriptor, Operation, Result,
};

use crate::database::{table_exists, table_info, trigger_exists, SqliteDatabase};
use crate::error::{SqliteError, SqliteResult};
use crate::schema::{create_registry, quote, LogSchema, MAX_CAPTURED_COLUMNS, REGISTRY_TABLE};

/// A registered capture, as stored in the registry table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureInfo {
    pub relation: String,
    pub log_table: String,
    pub columns: Vec<String>,
    pub primary_key: String,
    pub fingerprint: String,
    pub installed_at: String,
}

impl CaptureInfo {
    /// Rebuild the descriptor this capture was installed from.
    pub fn descriptor(&self) -> Result<LogTableDescriptor> {
        LogTableDescriptor::builder(&self.relation)
            .columns(self.columns.iter().cloned())
            .primary_key(&self.primary_key)
            .build()
    }
}

/// Installs SQLite triggers that append every mutation of a relation to its
/// change log.
#[derive(Clone)]
pub struct SqliteCapture {
    db: SqliteDatabase,
}

impl SqliteCapture {
    pub fn new(db: SqliteDatabase) -> Self {
        Self { db }
    }

    /// Registry entry for a relation, if it is captured.
    pub fn capture_info(&self, relation: &str) -> SqliteResult<Option<CaptureInfo>> {
        self.db.with_conn(|conn| read_registry(conn, relation))
    }

    /// All captured relations.
    pub fn captures(&self) -> SqliteResult<Vec<CaptureInfo>> {
        self.db.with_conn(|conn| {
            if !table_exists(conn, REGISTRY_TABLE)? {
                return Ok(vec![]);
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT relation, log_table, columns, primary_key, fingerprint, installed_at
                 FROM {} ORDER BY relation",
                quote(REGISTRY_TABLE)
            ))?;
            let rows = stmt.query_map([], registry_row)?;

            let mut result = Vec::new();
            for row in rows {
                result.push(decode_registry(row?)?);
            }
            Ok(result)
        })
    }

    fn install(&self, descriptor: &LogTableDescriptor) -> SqliteResult<CaptureStatus> {
        if descriptor.columns().len() > MAX_CAPTURED_COLUMNS {
            return Err(SqliteError::Core(Error::CaptureSetup(format!(
                "relation '{}' has {} columns; at most {} can be captured",
                descriptor.relation(),
                descriptor.columns().len(),
                MAX_CAPTURED_COLUMNS
            ))));
        }

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            check_source(&tx, descriptor)?;
            tx.execute_batch(&create_registry())?;

            let fingerprint = descriptor.fingerprint();
            let existing = read_registry(&tx, descriptor.relation())?;

            if let Some(info) = &existing {
                if info.fingerprint == fingerprint && triggers_installed(&tx, descriptor)? {
                    debug!(relation = descriptor.relation(), "Capture already installed");
                    return Ok(CaptureStatus::Unchanged);
                }
            }

            for sql in LogSchema::new(descriptor).install_statements() {
                tx.execute_batch(&sql)?;
            }

            tx.execute(
                &format!(
                    "INSERT INTO {} (relation, log_table, columns, primary_key, fingerprint)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(relation) DO UPDATE SET
                        log_table = excluded.log_table,
                        columns = excluded.columns,
                        primary_key = excluded.primary_key,
                        fingerprint = excluded.fingerprint,
                        installed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    quote(REGISTRY_TABLE)
                ),
                rusqlite::params![
                    descriptor.relation(),
                    descriptor.log_table(),
                    serde_json::to_string(descriptor.columns())
                        .map_err(|e| SqliteError::Serialization(e.to_string()))?,
                    descriptor.primary_key(),
                    fingerprint,
                ],
            )?;

            tx.commit()?;

            Ok(if existing.is_some() {
                CaptureStatus::Reinstalled
            } else {
                CaptureStatus::Installed
            })
        })
    }

    fn uninstall(&self, relation: &str) -> SqliteResult<bool> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;

            let Some(info) = read_registry(&tx, relation)? else {
                return Ok(false);
            };
            let descriptor = info.descriptor()?;
            let schema = LogSchema::new(&descriptor);

            for op in Operation::ALL {
                tx.execute_batch(&schema.drop_trigger(op))?;
            }
            tx.execute(
                &format!("DELETE FROM {} WHERE relation = ?1", quote(REGISTRY_TABLE)),
                [relation],
            )?;

            tx.commit()?;
            Ok(true)
        })
    }
}

impl ChangeCapture for SqliteCapture {
    fn initialize(&self, descriptor: &LogTableDescriptor) -> Result<CaptureStatus> {
        let status = self
            .install(descriptor)
            .map_err(|e| Error::CaptureSetup(setup_message(e)))?;

        if status != CaptureStatus::Unchanged {
            info!(
                relation = descriptor.relation(),
                log_table = %descriptor.log_table(),
                columns = descriptor.columns().len(),
                primary_key = descriptor.primary_key(),
                status = ?status,
                "Installed change capture"
            );
        }
        Ok(status)
    }

    fn is_initialized(&self, relation: &str) -> Result<bool> {
        Ok(self.capture_info(relation)?.is_some())
    }

    fn teardown(&self, relation: &str) -> Result<bool> {
        let removed = self
            .uninstall(relation)
            .map_err(|e| Error::CaptureSetup(setup_message(e)))?;
        if removed {
            info!(relation, "Removed change capture, log table kept");
        }
        Ok(removed)
    }
}

fn setup_message(err: SqliteError) -> String {
    match err {
        SqliteError::Core(Error::CaptureSetup(msg)) => msg,
        other => other.to_string(),
    }
}

/// The source table must exist and have every declared column.
fn check_source(conn: &Connection, descriptor: &LogTableDescriptor) -> SqliteResult<()> {
    let relation = descriptor.relation();
    if !table_exists(conn, relation)? {
        return Err(SqliteError::Core(Error::CaptureSetup(format!(
            "source table '{}' does not exist",
            relation
        ))));
    }

    let existing = table_info(conn, relation)?;
    for column in descriptor.columns() {
        if !existing.iter().any(|c| &c.name == column) {
            return Err(SqliteError::Core(Error::CaptureSetup(format!(
                "table '{}' has no column '{}'",
                relation, column
            ))));
        }
    }
    Ok(())
}

fn triggers_installed(conn: &Connection, descriptor: &LogTableDescriptor) -> SqliteResult<bool> {
    for op in Operation::ALL {
        if !trigger_exists(conn, &descriptor.trigger_name(op))? {
            return Ok(false);
        }
    }
    table_exists(conn, &descriptor.log_table())
}

type RegistryRow = (String, String, String, String, String, String);

fn registry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_registry(row: RegistryRow) -> SqliteResult<CaptureInfo> {
    let (relation, log_table, columns, primary_key, fingerprint, installed_at) = row;
    let columns: Vec<String> = serde_json::from_str(&columns)
        .map_err(|e| SqliteError::Serialization(format!("bad column list for '{}': {}", relation, e)))?;
    Ok(CaptureInfo {
        relation,
        log_table,
        columns,
        primary_key,
        fingerprint,
        installed_at,
    })
}

fn read_registry(conn: &Connection, relation: &str) -> SqliteResult<Option<CaptureInfo>> {
    if !table_exists(conn, REGISTRY_TABLE)? {
        return Ok(None);
    }

    let row = conn
        .query_row(
            &format!(
                "SELECT relation, log_table, columns, primary_key, fingerprint, installed_at
                 FROM {} WHERE relation = ?1",
                quote(REGISTRY_TABLE)
            ),
            [relation],
            registry_row,
        )
        .optional()?;

    row.map(decode_registry).transpose()
}
