//! deploy-runner - lease-based build-and-deploy worker
//!
//! ## Commands
//!
//! - `deploy-runner run` - Claim jobs until interrupted
//! - `deploy-runner run --once` - Make a single claim attempt
//! - `deploy-runner config` - Show the resolved configuration
//!
//! Configuration comes from the environment (`DEPLOY_BASE_URL`, `RUNNER_ID`,
//! `ACR_REGISTRY`, ...). Logging honours `RUST_LOG`.

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if std::env::var("RUNNER_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
