use anyhow::{Context, Result};
use colored::Colorize;

use tributary_core::{ChangeLog, ReplicationOutcome};

use crate::pipeline::Pipeline;

/// Replicate batches until one delivers nothing, then print a summary.
pub fn cmd_sync(pipeline: &Pipeline, batch_size: Option<usize>) -> Result<()> {
    let engine = pipeline.engine()?;
    let batch_size = batch_size.unwrap_or(engine.config().batch_size);
    if batch_size == 0 {
        anyhow::bail!("--batch-size must be greater than zero");
    }

    let mut total = ReplicationOutcome::default();
    loop {
        let outcome = engine
            .replicate_batch(batch_size)
            .with_context(|| format!("Failed to replicate '{}'", pipeline.relation()))?;
        accumulate(&mut total, &outcome);
        if outcome.applied == 0 {
            break;
        }
    }

    let pending = engine.log().statistics()?.totals().pending;

    if total.applied == 0 && total.failed == 0 && total.dead_lettered == 0 {
        println!("Nothing to replicate.");
    } else {
        println!(
            "{}",
            format!(
                "Replicated {} change(s) from '{}' to '{}'.",
                total.applied,
                pipeline.relation(),
                pipeline.config.target.table
            )
            .green()
        );
    }

    if total.failed > 0 {
        println!(
            "{}",
            format!("{} change(s) failed and will be retried.", total.failed).yellow()
        );
    }
    if total.dead_lettered > 0 {
        println!(
            "{}",
            format!(
                "{} change(s) moved to the dead letter queue. See: tributary dlq list",
                total.dead_lettered
            )
            .red()
        );
    }
    if pending > 0 {
        println!("{} change(s) still pending.", pending);
    }

    Ok(())
}

fn accumulate(total: &mut ReplicationOutcome, outcome: &ReplicationOutcome) {
    total.fetched += outcome.fetched;
    total.applied += outcome.applied;
    total.failed += outcome.failed;
    total.deferred += outcome.deferred;
    total.dead_lettered += outcome.dead_lettered;
    total.held_back += outcome.held_back;
    total.budget_exhausted |= outcome.budget_exhausted;
}
