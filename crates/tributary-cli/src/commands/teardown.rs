use anyhow::{Context, Result};
use colored::Colorize;
use tracing::info;

use tributary_core::ChangeCapture;

use crate::pipeline::Pipeline;

pub fn cmd_teardown(pipeline: &Pipeline) -> Result<()> {
    let relation = pipeline.relation();
    let removed = pipeline
        .capture()
        .teardown(relation)
        .with_context(|| format!("Failed to remove capture for '{}'", relation))?;

    if !removed {
        println!("'{}' is not captured, nothing to do.", relation);
        return Ok(());
    }

    info!(relation, "Capture removed");
    println!("{}", format!("Removed capture triggers from '{}'.", relation).green());
    println!(
        "The change log '{}' was kept. Drop it manually once it is no longer needed.",
        pipeline.descriptor.log_table()
    );
    Ok(())
}
