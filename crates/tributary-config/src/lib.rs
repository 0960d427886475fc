mod error;
mod settings;
mod validation;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    CaptureStrategy, MonitoringConfig, ReplicationSettings, SourceConfig, TargetConfig,
    TributaryConfig,
};
pub use validation::{to_descriptor, to_replication_config, validate_config};
