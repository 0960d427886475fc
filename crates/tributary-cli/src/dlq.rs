//! Dead letter queue command handlers.

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

use tributary_core::ChangeLog;

/// List dead-lettered changes, most recent first.
pub fn cmd_dlq_list(log: &impl ChangeLog, limit: usize) -> Result<()> {
    let entries = log.dead_letters(limit)?;

    if entries.is_empty() {
        println!("No dead-lettered changes for '{}'.", log.relation());
        return Ok(());
    }

    println!("\nDead Letter Queue ({}):", log.relation());
    println!(
        "{:<10} {:<8} {:<16} {:<8} {:<18} {:<40}",
        "Sequence", "Op", "Record", "Attempts", "Parked", "Error"
    );
    println!("{:-<104}", "");

    for entry in &entries {
        println!(
            "{:<10} {:<8} {:<16} {:<8} {:<18} {:<40}",
            entry.sequence_id,
            entry.operation.as_str(),
            truncate(&entry.record_id.to_string(), 16),
            entry.attempts,
            entry.dead_lettered_at.format("%Y-%m-%d %H:%M"),
            truncate(&entry.error_message, 40)
        );
    }

    println!("\nTotal: {} entries", entries.len());
    if entries.len() == limit {
        println!("(showing first {} - use --limit to see more)", limit);
    }

    Ok(())
}

/// Return one or all dead-lettered changes to the pending set.
pub fn cmd_dlq_retry(log: &impl ChangeLog, id: Option<u64>, all: bool) -> Result<()> {
    match (id, all) {
        (Some(sequence_id), _) => {
            let requeued = log
                .requeue_dead_letter(sequence_id)
                .with_context(|| format!("Failed to requeue change {}", sequence_id))?;
            if !requeued {
                anyhow::bail!("Change {} is not in the dead letter queue", sequence_id);
            }
            info!(relation = log.relation(), sequence_id, "Requeued dead-lettered change");
            println!(
                "{}",
                format!("Change {} will be retried on the next sync.", sequence_id).green()
            );
        }
        (None, true) => {
            let count = log
                .requeue_all_dead_letters()
                .context("Failed to requeue dead-lettered changes")?;
            info!(relation = log.relation(), count, "Requeued dead-lettered changes");
            println!(
                "{}",
                format!("{} change(s) will be retried on the next sync.", count).green()
            );
        }
        (None, false) => anyhow::bail!("Either --id or --all must be specified"),
    }

    Ok(())
}

/// Truncate a string to at most `max` characters.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
