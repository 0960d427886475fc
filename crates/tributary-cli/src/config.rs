use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use tributary_config::{validate_config, TributaryConfig};

/// Resolve environment variables in a string.
/// Supports ${VAR_NAME} syntax; unset variables resolve to an empty string.
pub fn resolve_env(s: &str) -> String {
    resolve_with(s, |name| std::env::var(name).ok())
}

fn resolve_with<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = s.to_string();
    let mut from = 0;

    while let Some(offset) = result[from..].find("${") {
        let start = from + offset;
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let value = lookup(&result[start + 2..start + end]).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
        // Substituted text is never rescanned.
        from = start + value.len();
    }

    result
}

/// Load `tributary.toml`, apply `TRIBUTARY_*` overrides from the environment,
/// resolve `${VAR}` references in database paths and validate the result.
pub fn load_config(path: &Path) -> Result<TributaryConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = TributaryConfig::parse(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    config
        .apply_overrides(|name| std::env::var(name).ok())
        .context("Invalid environment override")?;

    config.source.database = resolve_env(&config.source.database);
    config.target.database = resolve_env(&config.target.database);

    validate_config(&config).with_context(|| format!("Invalid config: {}", path.display()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_resolve_env() {
        std::env::set_var("TRIBUTARY_TEST_DIR", "/var/data");

        assert_eq!(resolve_env("${TRIBUTARY_TEST_DIR}"), "/var/data");
        assert_eq!(
            resolve_env("${TRIBUTARY_TEST_DIR}/app.db"),
            "/var/data/app.db"
        );
        assert_eq!(resolve_env("no_vars.db"), "no_vars.db");

        std::env::remove_var("TRIBUTARY_TEST_DIR");
    }

    #[test]
    fn test_resolve_unset_and_unterminated() {
        let lookup = |name: &str| (name == "A").then(|| "a".to_string());
        assert_eq!(resolve_with("${MISSING}/x", lookup), "/x");
        assert_eq!(resolve_with("${A}${A}", lookup), "aa");
        assert_eq!(resolve_with("${A}/${oops", lookup), "a/${oops");
    }

    #[test]
    fn test_resolved_value_is_not_rescanned() {
        let lookup = |name: &str| (name == "A").then(|| "${A}".to_string());
        assert_eq!(resolve_with("${A}", lookup), "${A}");
    }

    #[test]
    #[serial]
    fn test_load_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tributary.toml");
        fs::write(
            &path,
            r#"
[source]
database = "${TRIBUTARY_TEST_DATA}/app.db"
columns = ["id", "username"]

[target]
database = "${TRIBUTARY_TEST_DATA}/replica.db"
"#,
        )
        .unwrap();

        std::env::set_var("TRIBUTARY_TEST_DATA", "/srv");
        std::env::set_var("TRIBUTARY_BATCH_SIZE", "7");

        let config = load_config(&path).unwrap();
        assert_eq!(config.source.database, "/srv/app.db");
        assert_eq!(config.target.database, "/srv/replica.db");
        assert_eq!(config.replication.batch_size, 7);

        std::env::remove_var("TRIBUTARY_TEST_DATA");
        std::env::remove_var("TRIBUTARY_BATCH_SIZE");
    }

    #[test]
    #[serial]
    fn test_load_config_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tributary.toml");
        fs::write(
            &path,
            "[source]\ndatabase = \"a.db\"\ncolumns = []\n\n[target]\ndatabase = \"b.db\"\n",
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid config"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/tributary.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
