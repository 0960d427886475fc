use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod config;
mod dlq;
mod env;
mod pipeline;

use cli::{Cli, Commands, DlqCommands};
use pipeline::Pipeline;
use tributary_core::HealthStatus;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tributary=info".parse()?),
        )
        .init();

    // Load .env file if present
    env::load_dotenv_from_ancestors()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => commands::cmd_init(&path)?,
        Commands::Setup => commands::cmd_setup(&open(&cli.config)?)?,
        Commands::Run { once } => commands::cmd_run(open(&cli.config)?, once).await?,
        Commands::Sync { batch_size } => commands::cmd_sync(&open(&cli.config)?, batch_size)?,
        Commands::Status => commands::cmd_status(&open(&cli.config)?)?,
        Commands::Health { json, strict } => {
            let status = commands::cmd_health(&open(&cli.config)?, json)?;
            if strict && status != HealthStatus::Healthy {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Dlq { command } => cmd_dlq(&open(&cli.config)?, command)?,
        Commands::Teardown => commands::cmd_teardown(&open(&cli.config)?)?,
    }

    Ok(ExitCode::SUCCESS)
}

fn open(path: &Path) -> Result<Pipeline> {
    Pipeline::open(config::load_config(path)?)
}

fn cmd_dlq(pipeline: &Pipeline, command: DlqCommands) -> Result<()> {
    let log = pipeline.change_log()?;

    match command {
        DlqCommands::List { limit } => dlq::cmd_dlq_list(&log, limit),
        DlqCommands::Retry { id, all } => dlq::cmd_dlq_retry(&log, id, all),
    }
}
