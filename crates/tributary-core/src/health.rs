//! Point-in-time health reporting over a change log.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stats::OperationStats;
use crate::store::ChangeLog;
use crate::types::Operation;

/// Pending count above which a relation reports [`HealthStatus::Warning`].
pub const DEFAULT_PENDING_THRESHOLD: u64 = 1000;

/// Overall replication health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Backlog is within the threshold.
    Healthy,
    /// Backlog exceeds the threshold; the target is falling behind or
    /// records keep failing.
    Warning,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one relation's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub relation: String,
    pub total_changes: u64,
    pub pending_changes: u64,
    pub delivered_changes: u64,
    pub dead_lettered_changes: u64,
    pub by_operation: BTreeMap<Operation, OperationStats>,
    pub status: HealthStatus,
}

const RULE: &str = "============================================================";

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE)?;
        writeln!(f, "CDC HEALTH REPORT - {}", self.timestamp.to_rfc3339())?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Table: {}", self.relation)?;
        writeln!(f, "Status: {}", self.status.as_str().to_uppercase())?;
        writeln!(f)?;
        writeln!(f, "Total Changes: {}", self.total_changes)?;
        writeln!(f, "Pending: {}", self.pending_changes)?;
        writeln!(f, "Delivered: {}", self.delivered_changes)?;
        if self.dead_lettered_changes > 0 {
            writeln!(f, "Dead-lettered: {}", self.dead_lettered_changes)?;
        }
        writeln!(f)?;
        writeln!(f, "By Operation:")?;
        if self.by_operation.is_empty() {
            writeln!(f, "  (no changes captured)")?;
        }
        for (op, stats) in &self.by_operation {
            writeln!(
                f,
                "  {}: {} total, {} pending",
                op, stats.total, stats.pending
            )?;
        }
        write!(f, "{}", RULE)
    }
}

/// Derives health reports from a change log's statistics.
pub struct HealthMonitor<L> {
    log: L,
    pending_threshold: u64,
}

impl<L: ChangeLog> HealthMonitor<L> {
    pub fn new(log: L) -> Self {
        Self {
            log,
            pending_threshold: DEFAULT_PENDING_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, pending_threshold: u64) -> Self {
        self.pending_threshold = pending_threshold;
        self
    }

    pub fn pending_threshold(&self) -> u64 {
        self.pending_threshold
    }

    /// Aggregate the log as of now. Every call re-reads the statistics.
    pub fn report(&self) -> Result<HealthReport> {
        let stats = self.log.statistics()?;
        let totals = stats.totals();

        let status = if totals.pending > self.pending_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthReport {
            timestamp: Utc::now(),
            relation: self.log.relation().to_string(),
            total_changes: totals.total,
            pending_changes: totals.pending,
            delivered_changes: totals.delivered,
            dead_lettered_changes: totals.dead_lettered,
            by_operation: stats.by_operation().clone(),
            status,
        })
    }
}
