use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use tributary_core::{HealthMonitor, HealthStatus, ReplicationOutcome};
use tributary_sqlite::SqliteChangeLog;

use crate::pipeline::{Pipeline, SqliteEngine};

/// Replicate on a fixed interval until interrupted.
///
/// Cycle failures are logged and the cycle is retried on the next tick. With
/// `once`, the loop stops after the first cycle that delivers nothing and a
/// failed cycle is returned as an error.
pub async fn cmd_run(pipeline: Pipeline, once: bool) -> Result<()> {
    let settings = pipeline.config.replication.clone();
    let monitoring = pipeline.config.monitoring.clone();

    let engine = Arc::new(pipeline.engine()?);
    let monitor = Arc::new(pipeline.monitor()?);

    info!(
        relation = pipeline.relation(),
        replica = %pipeline.config.target.table,
        batch_size = settings.batch_size,
        sync_interval_seconds = settings.sync_interval_seconds,
        max_retries = settings.max_retries,
        "Starting replication loop"
    );

    let mut sync_ticker = interval(Duration::from_secs(settings.sync_interval_seconds.max(1)));
    sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut metrics_ticker =
        interval(Duration::from_secs(monitoring.metrics_interval_seconds.max(1)));
    metrics_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut delivered_total = 0usize;

    loop {
        tokio::select! {
            _ = sync_ticker.tick() => {
                let result = run_cycle(Arc::clone(&engine)).await?;
                if let Ok(outcome) = &result {
                    delivered_total += outcome.applied;
                }
                if cycle_finishes_run(pipeline.relation(), once, result)? {
                    break;
                }
            }
            _ = metrics_ticker.tick(), if monitoring.enable_metrics => {
                log_health(Arc::clone(&monitor)).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
        }
    }

    info!(
        relation = pipeline.relation(),
        delivered = delivered_total,
        "Replication loop stopped"
    );
    Ok(())
}

/// Whether the loop should stop after this cycle. A failed cycle is logged
/// and retried, except under `once` where it ends the run with an error.
fn cycle_finishes_run(
    relation: &str,
    once: bool,
    result: tributary_core::Result<ReplicationOutcome>,
) -> Result<bool> {
    match result {
        Ok(outcome) => Ok(once && outcome.applied == 0),
        Err(e) if once => Err(e).context("Replication cycle failed"),
        Err(e) => {
            error!(relation, error = %e, "Replication cycle failed");
            Ok(false)
        }
    }
}

/// Run one engine cycle off the async runtime.
async fn run_cycle(engine: Arc<SqliteEngine>) -> Result<tributary_core::Result<ReplicationOutcome>> {
    tokio::task::spawn_blocking(move || engine.run_cycle())
        .await
        .context("Replication task panicked")
}

async fn log_health(monitor: Arc<HealthMonitor<SqliteChangeLog>>) -> Result<()> {
    let report = tokio::task::spawn_blocking(move || monitor.report())
        .await
        .context("Health task panicked")?;

    match report {
        Ok(report) if report.status == HealthStatus::Healthy => info!(
            relation = %report.relation,
            total = report.total_changes,
            pending = report.pending_changes,
            delivered = report.delivered_changes,
            dead_lettered = report.dead_lettered_changes,
            status = %report.status,
            "Health check"
        ),
        Ok(report) => warn!(
            relation = %report.relation,
            total = report.total_changes,
            pending = report.pending_changes,
            delivered = report.delivered_changes,
            dead_lettered = report.dead_lettered_changes,
            status = %report.status,
            "Pending changes above warning threshold"
        ),
        Err(e) => error!(error = %e, "Health check failed"),
    }
    Ok(())
}
