use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("[source] must list at least one column")]
    NoColumns,

    #[error("column '{column}' is listed more than once")]
    DuplicateColumn { column: String },

    #[error("primary key '{column}' is not in the columns list")]
    PrimaryKeyNotInColumns { column: String },

    #[error("invalid source description: {0}")]
    Descriptor(#[from] tributary_core::Error),

    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,

    #[error("source and target are both '{table}' in '{database}'")]
    SameSourceAndTarget { database: String, table: String },

    #[error("strategy '{value}' is not supported: only 'trigger' capture is implemented")]
    UnsupportedStrategy { value: String },

    #[error("invalid value '{value}' for {name}: expected {expected}")]
    InvalidOverride {
        name: String,
        value: String,
        expected: &'static str,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
