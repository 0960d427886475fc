use std::time::Duration;

use tributary_core::{LogTableDescriptor, ReplicationConfig, RetryPolicy};

use crate::error::{ConfigError, ConfigResult};
use crate::settings::{CaptureStrategy, TributaryConfig};

/// Validate a parsed configuration.
pub fn validate_config(config: &TributaryConfig) -> ConfigResult<()> {
    validate_strategy(config)?;
    validate_columns(config)?;
    validate_batching(config)?;
    validate_distinct_target(config)?;
    Ok(())
}

fn validate_strategy(config: &TributaryConfig) -> ConfigResult<()> {
    match config.replication.strategy {
        CaptureStrategy::Trigger => Ok(()),
        other => Err(ConfigError::UnsupportedStrategy {
            value: other.to_string(),
        }),
    }
}

fn validate_columns(config: &TributaryConfig) -> ConfigResult<()> {
    let columns = &config.source.columns;
    if columns.is_empty() {
        return Err(ConfigError::NoColumns);
    }

    for (i, column) in columns.iter().enumerate() {
        if columns[..i].contains(column) {
            return Err(ConfigError::DuplicateColumn {
                column: column.clone(),
            });
        }
    }

    if let Some(pk) = &config.source.primary_key {
        if !columns.contains(pk) {
            return Err(ConfigError::PrimaryKeyNotInColumns { column: pk.clone() });
        }
    }

    // Identifier rules live with the descriptor.
    to_descriptor_unchecked(config)?;
    tributary_core::validate_identifier(&config.target.table)?;
    Ok(())
}

fn validate_batching(config: &TributaryConfig) -> ConfigResult<()> {
    if config.replication.batch_size == 0 {
        return Err(ConfigError::ZeroBatchSize);
    }
    Ok(())
}

fn validate_distinct_target(config: &TributaryConfig) -> ConfigResult<()> {
    if config.source.database == config.target.database
        && config.source.table == config.target.table
    {
        return Err(ConfigError::SameSourceAndTarget {
            database: config.source.database.clone(),
            table: config.source.table.clone(),
        });
    }
    Ok(())
}

fn to_descriptor_unchecked(config: &TributaryConfig) -> ConfigResult<LogTableDescriptor> {
    let mut builder =
        LogTableDescriptor::builder(&config.source.table).columns(config.source.columns.iter());
    if let Some(pk) = &config.source.primary_key {
        builder = builder.primary_key(pk);
    }
    Ok(builder.build()?)
}

/// Convert a validated config to the source relation's descriptor.
pub fn to_descriptor(config: &TributaryConfig) -> ConfigResult<LogTableDescriptor> {
    validate_config(config)?;
    to_descriptor_unchecked(config)
}

/// Convert the replication settings to engine tuning.
pub fn to_replication_config(config: &TributaryConfig) -> ReplicationConfig {
    let settings = &config.replication;
    let max_batch_duration = match settings.max_batch_duration_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };

    ReplicationConfig {
        batch_size: settings.batch_size,
        max_batch_duration,
        retry: RetryPolicy::new(
            settings.max_retries,
            Duration::from_secs(settings.retry_delay_seconds),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> TributaryConfig {
        TributaryConfig::parse(toml).unwrap()
    }

    fn config_with(source: &str, target: &str, replication: &str) -> TributaryConfig {
        parse(&format!(
            "[source]\n{}\n\n[target]\n{}\n\n[replication]\n{}\n",
            source, target, replication
        ))
    }

    fn valid() -> TributaryConfig {
        config_with(
            r#"database = "app.db"
columns = ["id", "username", "email"]"#,
            r#"database = "app.db""#,
            "",
        )
    }

    #[test]
    fn test_validate_minimal_valid() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_to_descriptor() {
        let descriptor = to_descriptor(&valid()).unwrap();
        assert_eq!(descriptor.relation(), "users");
        assert_eq!(descriptor.primary_key(), "id");
        assert_eq!(descriptor.columns().len(), 3);
    }

    #[test]
    fn test_explicit_primary_key() {
        let config = config_with(
            r#"database = "a.db"
columns = ["id", "email"]
primary_key = "email""#,
            r#"database = "b.db""#,
            "",
        );
        assert_eq!(to_descriptor(&config).unwrap().primary_key(), "email");
    }

    #[test]
    fn test_validate_no_columns() {
        let config = config_with(
            r#"database = "a.db"
columns = []"#,
            r#"database = "b.db""#,
            "",
        );
        assert!(matches!(validate_config(&config), Err(ConfigError::NoColumns)));
    }

    #[test]
    fn test_validate_duplicate_column() {
        let config = config_with(
            r#"database = "a.db"
columns = ["id", "name", "id"]"#,
            r#"database = "b.db""#,
            "",
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_validate_primary_key_not_in_columns() {
        let config = config_with(
            r#"database = "a.db"
columns = ["id", "name"]
primary_key = "uuid""#,
            r#"database = "b.db""#,
            "",
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::PrimaryKeyNotInColumns { .. })
        ));
    }

    #[test]
    fn test_validate_bad_identifier() {
        let config = config_with(
            r#"database = "a.db"
table = "users; drop table x"
columns = ["id"]"#,
            r#"database = "b.db""#,
            "",
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Descriptor(_))
        ));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let config = config_with(
            r#"database = "a.db"
columns = ["id"]"#,
            r#"database = "b.db""#,
            "batch_size = 0",
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ZeroBatchSize)
        ));
    }

    #[test]
    fn test_validate_same_source_and_target() {
        let config = config_with(
            r#"database = "a.db"
columns = ["id"]"#,
            r#"database = "a.db"
table = "users""#,
            "",
        );
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::SameSourceAndTarget { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_polling_strategies() {
        for strategy in ["timestamp", "version"] {
            let config = config_with(
                r#"database = "a.db"
columns = ["id"]"#,
                r#"database = "b.db""#,
                &format!("strategy = \"{}\"", strategy),
            );
            let err = validate_config(&config).unwrap_err();
            assert!(matches!(err, ConfigError::UnsupportedStrategy { .. }));
            assert!(err.to_string().contains(strategy));
        }
    }

    #[test]
    fn test_to_replication_config() {
        let config = config_with(
            r#"database = "a.db"
columns = ["id"]"#,
            r#"database = "b.db""#,
            "batch_size = 50\nmax_retries = 5\nretry_delay_seconds = 2\nmax_batch_duration_ms = 0",
        );
        let replication = to_replication_config(&config);
        assert_eq!(replication.batch_size, 50);
        assert_eq!(replication.max_batch_duration, None);
        assert_eq!(replication.retry.max_retries, 5);
        assert_eq!(replication.retry.base_delay, Duration::from_secs(2));

        let defaults = to_replication_config(&valid());
        assert_eq!(
            defaults.max_batch_duration,
            Some(Duration::from_millis(30_000))
        );
    }
}
