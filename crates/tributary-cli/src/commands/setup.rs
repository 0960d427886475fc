use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

use tributary_core::{CaptureStatus, ChangeCapture};
use tributary_sqlite::{source_columns, SqliteTarget};

use crate::pipeline::Pipeline;

pub fn cmd_setup(pipeline: &Pipeline) -> Result<()> {
    let descriptor = &pipeline.descriptor;
    println!(
        "Setting up change capture for '{}'...\n",
        descriptor.relation()
    );

    println!("The following objects are managed in the source database:");
    println!("  - {:<28} - ordered change records", descriptor.log_table());
    println!("  - {:<28} - retry state of failed changes", descriptor.retry_table());
    println!("  - {:<28} - dead letter queue", descriptor.dead_letter_table());
    println!("  - insert/update/delete triggers on {}", descriptor.relation());
    println!();

    let status = pipeline
        .capture()
        .initialize(descriptor)
        .with_context(|| format!("Failed to set up capture for '{}'", descriptor.relation()))?;

    match status {
        CaptureStatus::Installed => println!("{}", "Capture installed.".green()),
        CaptureStatus::Reinstalled => println!(
            "{}",
            "Capture reinstalled: triggers now match the configured columns.".yellow()
        ),
        CaptureStatus::Unchanged => println!("Capture already up to date."),
    }

    let replica = &pipeline.config.target.table;
    let columns = source_columns(&pipeline.source, descriptor.relation(), descriptor.columns())?;
    let (_, created) = SqliteTarget::create_like(
        pipeline.target.clone(),
        replica,
        descriptor.primary_key(),
        &columns,
    )
    .with_context(|| format!("Failed to prepare replica table '{}'", replica))?;

    if created {
        println!("{}", format!("Created replica table '{}'.", replica).green());
    } else {
        println!("Replica table '{}' already exists.", replica);
    }

    info!(
        relation = descriptor.relation(),
        replica = %replica,
        status = ?status,
        created,
        "Setup complete"
    );

    println!("\nNext steps:");
    println!("  1. Run: tributary sync    (replicate what is pending and exit)");
    println!("  2. Run: tributary run     (keep replicating)\n");

    Ok(())
}
