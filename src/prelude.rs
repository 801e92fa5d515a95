//! Prelude module for common imports

pub use crate::executor::{CommandError, CommandRunner, ProcessCommand, ProcessRunner, Workspace};
pub use crate::infrastructure::{
    ArtifactCleaner, ContainerEngine, GitFetcher, HttpJobQueue, HttpRuntimeClient, JobQueue,
    RegistryClient, RunnerConfig, RuntimeDeployer,
};
pub use crate::pipeline::{
    DeployPlan, Job, JobOutcome, LeaseHeartbeat, Orchestrator, Phase, PollOutcome, ReportStatus,
    RunnerError,
};
