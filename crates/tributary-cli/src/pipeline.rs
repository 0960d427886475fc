//! Wiring from a validated config to the SQLite-backed components.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use tributary_config::{to_descriptor, to_replication_config, TributaryConfig};
use tributary_core::{HealthMonitor, LogTableDescriptor, ReplicationEngine};
use tributary_sqlite::{SqliteCapture, SqliteChangeLog, SqliteDatabase, SqliteTarget};

pub type SqliteEngine = ReplicationEngine<SqliteChangeLog, SqliteTarget>;

/// Open connections for one configured source/target pair.
pub struct Pipeline {
    pub config: TributaryConfig,
    pub descriptor: LogTableDescriptor,
    pub source: SqliteDatabase,
    pub target: SqliteDatabase,
}

impl Pipeline {
    pub fn open(config: TributaryConfig) -> Result<Self> {
        let descriptor = to_descriptor(&config)?;

        let source = SqliteDatabase::open(&config.source.database).with_context(|| {
            format!("Failed to open source database: {}", config.source.database)
        })?;

        // One connection when both sides live in the same file, so the
        // replica and the log never contend for the write lock.
        let target = if same_database(&config.source.database, &config.target.database) {
            debug!(database = %config.source.database, "Source and target share a database");
            source.clone()
        } else {
            SqliteDatabase::open(&config.target.database).with_context(|| {
                format!("Failed to open target database: {}", config.target.database)
            })?
        };

        Ok(Self {
            config,
            descriptor,
            source,
            target,
        })
    }

    pub fn relation(&self) -> &str {
        self.descriptor.relation()
    }

    pub fn capture(&self) -> SqliteCapture {
        SqliteCapture::new(self.source.clone())
    }

    pub fn change_log(&self) -> Result<SqliteChangeLog> {
        SqliteChangeLog::open(self.source.clone(), self.descriptor.clone()).with_context(|| {
            format!(
                "Table '{}' is not captured. Run 'tributary setup' first.",
                self.relation()
            )
        })
    }

    pub fn replica(&self) -> Result<SqliteTarget> {
        let table = &self.config.target.table;
        SqliteTarget::new(self.target.clone(), table, self.descriptor.primary_key()).with_context(
            || format!("Replica table '{}' is not usable. Run 'tributary setup' first.", table),
        )
    }

    pub fn engine(&self) -> Result<SqliteEngine> {
        Ok(
            ReplicationEngine::new(self.descriptor.clone(), self.change_log()?, self.replica()?)
                .with_config(to_replication_config(&self.config)),
        )
    }

    pub fn monitor(&self) -> Result<HealthMonitor<SqliteChangeLog>> {
        Ok(HealthMonitor::new(self.change_log()?)
            .with_threshold(self.config.monitoring.pending_warning_threshold))
    }
}

fn same_database(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (Path::new(a).canonicalize(), Path::new(b).canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
