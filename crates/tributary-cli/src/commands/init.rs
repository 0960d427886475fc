use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{info, warn};

const CONFIG_TEMPLATE: &str = r#"# Tributary configuration
# Database paths may reference environment variables, e.g. "${TRIBUTARY_DATA_DIR}/app.db"

[source]
database = "${TRIBUTARY_SOURCE_DB}"
table = "users"
columns = ["id", "username", "email", "status"]
# primary_key = "id"   # defaults to the first column

[target]
database = "${TRIBUTARY_TARGET_DB}"
table = "users_replica"

[replication]
strategy = "trigger"
batch_size = 100
sync_interval_seconds = 5
max_retries = 3
retry_delay_seconds = 10
max_batch_duration_ms = 30000

[monitoring]
enable_metrics = true
metrics_interval_seconds = 60
pending_warning_threshold = 1000
"#;

const ENV_TEMPLATE: &str = r#"# Tributary environment variables
# Copy this file to .env and fill in your values

TRIBUTARY_SOURCE_DB=source.db
TRIBUTARY_TARGET_DB=target.db

# Optional: override [replication] and [monitoring] settings
# TRIBUTARY_BATCH_SIZE=100
# TRIBUTARY_SYNC_INTERVAL=5
# TRIBUTARY_MAX_RETRIES=3
# TRIBUTARY_RETRY_DELAY=10
# TRIBUTARY_PENDING_THRESHOLD=1000
# TRIBUTARY_ENABLE_METRICS=true
"#;

pub fn cmd_init(path: &Path) -> Result<()> {
    info!(path = %path.display(), "Initializing tributary project");
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    write_if_missing(&path.join("tributary.toml"), CONFIG_TEMPLATE)?;
    write_if_missing(&path.join(".env.example"), ENV_TEMPLATE)?;
    ignore_dotenv(&path.join(".gitignore"))?;

    println!("\n{}", "Tributary project initialized!".green().bold());
    println!("\nNext steps:");
    println!("  1. Copy .env.example to .env and point it at your databases");
    println!("  2. Edit tributary.toml to list the columns to capture");
    println!("  3. Run: tributary setup");
    println!("  4. Run: tributary run\n");

    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        warn!(path = %path.display(), "File already exists, skipping");
        println!("{} already exists, skipping", path.display());
        return Ok(());
    }

    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}

fn ignore_dotenv(gitignore: &Path) -> Result<()> {
    if gitignore.exists() {
        let content = fs::read_to_string(gitignore)?;
        if !content.lines().any(|line| line.trim() == ".env") {
            let mut file = fs::OpenOptions::new().append(true).open(gitignore)?;
            writeln!(file, "\n# Tributary secrets\n.env")?;
            println!("Added .env to .gitignore");
        }
    } else {
        fs::write(gitignore, "# Tributary secrets\n.env\n")?;
        println!("Created .gitignore with .env");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tributary_config::TributaryConfig;

    #[test]
    fn test_config_template_parses() {
        let config = TributaryConfig::parse(CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.source.table, "users");
        assert_eq!(config.target.table, "users_replica");
        assert_eq!(config.source.columns.len(), 4);
    }

    #[test]
    fn test_init_writes_files_once() {
        let dir = TempDir::new().unwrap();
        cmd_init(dir.path()).unwrap();

        let config_path = dir.path().join("tributary.toml");
        assert!(config_path.exists());
        assert!(dir.path().join(".env.example").exists());

        fs::write(&config_path, "# edited").unwrap();
        cmd_init(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(&config_path).unwrap(), "# edited");

        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(gitignore.matches(".env\n").count(), 1);
    }

    #[test]
    fn test_ignore_dotenv_appends_to_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".gitignore");
        fs::write(&path, "target/\n").unwrap();

        ignore_dotenv(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("target/\n"));
        assert!(content.lines().any(|l| l == ".env"));
    }
}
