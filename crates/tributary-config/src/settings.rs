use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{ConfigError, ConfigResult};

/// Raw project configuration as parsed from `tributary.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct TributaryConfig {
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl TributaryConfig {
    /// Parse a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: TributaryConfig = toml::from_str(toml_str)?;
        Ok(config)
    }

    /// Apply `TRIBUTARY_*` overrides for the replication and monitoring
    /// knobs. `lookup` resolves a variable name to its value, if set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = override_value(&lookup, "TRIBUTARY_BATCH_SIZE")? {
            self.replication.batch_size = v;
        }
        if let Some(v) = override_value(&lookup, "TRIBUTARY_SYNC_INTERVAL")? {
            self.replication.sync_interval_seconds = v;
        }
        if let Some(v) = override_value(&lookup, "TRIBUTARY_MAX_RETRIES")? {
            self.replication.max_retries = v;
        }
        if let Some(v) = override_value(&lookup, "TRIBUTARY_RETRY_DELAY")? {
            self.replication.retry_delay_seconds = v;
        }
        if let Some(v) = override_value(&lookup, "TRIBUTARY_PENDING_THRESHOLD")? {
            self.monitoring.pending_warning_threshold = v;
        }
        if let Some(v) = lookup("TRIBUTARY_ENABLE_METRICS") {
            self.monitoring.enable_metrics = match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        name: "TRIBUTARY_ENABLE_METRICS".into(),
                        value: v,
                        expected: "true or false",
                    })
                }
            };
        }
        Ok(())
    }
}

fn override_value<F, T>(lookup: &F, name: &str) -> ConfigResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride {
                name: name.to_string(),
                value: raw,
                expected: "a non-negative integer",
            }),
    }
}

/// The captured source relation.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Path to the SQLite database file. Supports `${VAR}` references.
    pub database: String,
    #[serde(default = "default_source_table")]
    pub table: String,
    /// Columns to capture, in order.
    pub columns: Vec<String>,
    /// Key column; defaults to the first entry of `columns`.
    pub primary_key: Option<String>,
}

/// The replica the change log is applied to.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Path to the SQLite database file. May equal the source database.
    pub database: String,
    #[serde(default = "default_target_table")]
    pub table: String,
}

/// How changes are captured.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStrategy {
    /// Row triggers append to a change log table.
    #[default]
    Trigger,
    /// Poll a last-modified timestamp column.
    Timestamp,
    /// Poll a monotonically increasing version column.
    Version,
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptureStrategy::Trigger => "trigger",
            CaptureStrategy::Timestamp => "timestamp",
            CaptureStrategy::Version => "version",
        })
    }
}

/// Replication loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub strategy: CaptureStrategy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    /// Wall-clock budget per batch; 0 disables it.
    #[serde(default = "default_max_batch_duration")]
    pub max_batch_duration_ms: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            strategy: CaptureStrategy::default(),
            batch_size: default_batch_size(),
            sync_interval_seconds: default_sync_interval(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            max_batch_duration_ms: default_max_batch_duration(),
        }
    }
}

/// Health reporting settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Log a health report periodically while running.
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_seconds: u64,
    #[serde(default = "default_pending_threshold")]
    pub pending_warning_threshold: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_enable_metrics(),
            metrics_interval_seconds: default_metrics_interval(),
            pending_warning_threshold: default_pending_threshold(),
        }
    }
}

fn default_source_table() -> String {
    "users".to_string()
}

fn default_target_table() -> String {
    "users_replica".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_sync_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    10
}

fn default_max_batch_duration() -> u64 {
    30_000
}

fn default_enable_metrics() -> bool {
    true
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_pending_threshold() -> u64 {
    tributary_core::DEFAULT_PENDING_THRESHOLD
}
