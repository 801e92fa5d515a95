//! Infrastructure layer
//!
//! Adapters to the systems the runner talks to: the job queue, runtime
//! agents, git, the container engine and image registries. Configuration,
//! logging and metrics live here too.

mod artifacts;
mod config;
pub mod container;
pub mod git;
mod logging;
mod metrics;
pub mod queue;
pub mod registry;
pub mod runtime;

pub use artifacts::{ArtifactCleaner, ArtifactLifecycle, CleanupReport};
pub use config::{ConfigError, RegistryCredentials, RunnerConfig};
pub use container::ContainerEngine;
pub use git::{FetchMode, GitFetcher};
pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, RunnerMetrics};
pub use queue::{HttpJobQueue, JobQueue, QueueError};
pub use registry::{
    AuthScheme, BearerChallenge, DeletionOutcome, ManifestRef, RegistryClient, RegistryError,
    SkipReason,
};
pub use runtime::{DeployRequest, HttpRuntimeClient, RuntimeDeployer};
