//! Command-line surface
//!
//! - `run`: claim and process jobs until Ctrl-C (or one cycle with `--once`)
//! - `config`: print the resolved configuration, secrets redacted

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deploy_runner::{Orchestrator, PollOutcome, RunnerConfig, init_logging};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// CLI arguments for deploy-runner
#[derive(Parser, Debug)]
#[command(name = "deploy-runner")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim and process deploy jobs
    Run {
        /// Make a single claim attempt and exit
        #[arg(long)]
        once: bool,
    },

    /// Print the resolved configuration as JSON
    Config,
}

/// Parse and execute CLI arguments
pub fn run() -> Result<()> {
    let args = Args::parse();
    let config = RunnerConfig::from_env().context("invalid configuration")?;

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run { once } => {
            let _guard = init_logging(&config.log_level, config.log_dir.as_deref())?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(run_worker(Arc::new(config), once))
        }
    }
}

async fn run_worker(config: Arc<RunnerConfig>, once: bool) -> Result<()> {
    let orchestrator =
        Orchestrator::from_config(config).context("failed to initialise HTTP clients")?;

    if once {
        return match orchestrator.poll_once().await {
            PollOutcome::Finished(outcome) if !outcome.is_success() => {
                anyhow::bail!(
                    "job {} failed: {}",
                    outcome.job_id,
                    outcome.error.unwrap_or_default()
                )
            }
            PollOutcome::ClaimFailed => anyhow::bail!("claim failed"),
            outcome => {
                info!(outcome = ?outcome, "Single poll finished");
                Ok(())
            }
        };
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested; finishing the current job"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C; stopping"),
        }
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await;
    Ok(())
}
