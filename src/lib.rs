//! # deploy-runner
//!
//! A lease-based deploy worker. It claims jobs from a queue service, keeps
//! the lease alive while it works, builds and pushes an image from source
//! when the job does not name one, asks a runtime agent to run it, and
//! reports the outcome exactly once.
//!
//! After a successful source build the image is removed from the local
//! engine and its manifest is deleted from the registry, following the
//! registry's bearer-challenge flow.
//!
//! ## Layout
//!
//! - [`executor`]: external processes and per-job work directories
//! - [`infrastructure`]: queue, runtime agent, git, container engine and
//!   registry adapters, plus configuration, logging and metrics
//! - [`pipeline`]: job types, plan resolution, heartbeats and the
//!   [`Orchestrator`]
//!
//! ## License
//!
//! Licensed under either of
//! - Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <https://www.apache.org/licenses/LICENSE-2.0>)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or <https://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod executor;
pub mod infrastructure;
pub mod pipeline;

// Prelude module for common imports
pub mod prelude;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use executor::{CommandError, CommandOutput, CommandRunner, ProcessCommand, ProcessRunner};
pub use infrastructure::{
    ConfigError, DeletionOutcome, JobQueue, RegistryClient, RunnerConfig, RunnerMetrics,
    RuntimeDeployer, init_logging,
};
pub use pipeline::{Job, JobOutcome, Orchestrator, PollOutcome, ReportStatus, RunnerError};

/// Version of the deploy-runner crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
