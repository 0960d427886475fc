use anyhow::Result;
use colored::Colorize;

use tributary_core::{ChangeLog, Operation};

use crate::pipeline::Pipeline;

pub fn cmd_status(pipeline: &Pipeline) -> Result<()> {
    let captures = pipeline.capture().captures()?;

    if captures.is_empty() {
        println!("No captured tables found. Run 'tributary setup' to install capture.");
        return Ok(());
    }

    println!("\nCaptured Tables:");
    println!("{:<24} {:<28} {:>8} {:<24}", "Table", "Change Log", "Columns", "Installed");
    println!("{:-<88}", "");
    for capture in &captures {
        println!(
            "{:<24} {:<28} {:>8} {:<24}",
            capture.relation,
            capture.log_table,
            capture.columns.len(),
            capture.installed_at
        );
    }

    let Some(info) = captures.iter().find(|c| c.relation == pipeline.relation()) else {
        println!(
            "\n{}",
            format!(
                "'{}' is not captured. Run 'tributary setup' to install capture.",
                pipeline.relation()
            )
            .yellow()
        );
        return Ok(());
    };

    if info.fingerprint != pipeline.descriptor.fingerprint() {
        println!(
            "\n{}",
            "Configured columns differ from the installed triggers. Run 'tributary setup' to update."
                .yellow()
        );
    }

    let statistics = pipeline.change_log()?.statistics()?;

    println!("\nDelivery Status ({} -> {}):", pipeline.relation(), pipeline.config.target.table);
    println!(
        "{:<10} {:>12} {:>12} {:>12} {:>12}",
        "Operation", "Total", "Pending", "Delivered", "Dead"
    );
    println!("{:-<62}", "");

    for op in Operation::ALL {
        let stats = statistics.get(op).copied().unwrap_or_default();
        println!(
            "{:<10} {:>12} {:>12} {:>12} {:>12}",
            op.as_str(),
            stats.total,
            stats.pending,
            stats.delivered,
            stats.dead_lettered
        );
    }

    let totals = statistics.totals();
    println!("{:-<62}", "");
    println!(
        "{:<10} {:>12} {:>12} {:>12} {:>12}",
        "TOTAL", totals.total, totals.pending, totals.delivered, totals.dead_lettered
    );

    println!();
    Ok(())
}
