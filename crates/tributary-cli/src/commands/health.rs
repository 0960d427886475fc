use anyhow::{Context, Result};
use colored::Colorize;

use tributary_core::HealthStatus;

use crate::pipeline::Pipeline;

/// Print the health report. Returns the report's status so `--strict` can
/// turn a warning into a failing exit code.
pub fn cmd_health(pipeline: &Pipeline, json: bool) -> Result<HealthStatus> {
    let monitor = pipeline.monitor()?;
    let report = monitor
        .report()
        .with_context(|| format!("Failed to build health report for '{}'", pipeline.relation()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.status);
    }

    println!("{}", report);
    match report.status {
        HealthStatus::Healthy => println!("{}", "Replication is healthy.".green()),
        HealthStatus::Warning => println!(
            "{}",
            format!(
                "{} pending change(s) exceed the warning threshold of {}.",
                report.pending_changes,
                monitor.pending_threshold()
            )
            .yellow()
        ),
    }
    if report.dead_lettered_changes > 0 {
        println!(
            "{}",
            format!(
                "{} change(s) are in the dead letter queue. See: tributary dlq list",
                report.dead_lettered_changes
            )
            .red()
        );
    }

    Ok(report.status)
}
