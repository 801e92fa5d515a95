//! Job pipeline: domain types, plan resolution, lease renewal and the claim
//! loop that ties them together.

pub mod errors;
pub mod heartbeat;
pub mod orchestrator;
pub mod plan;
pub mod types;

pub use errors::RunnerError;
pub use heartbeat::{LeaseHeartbeat, MIN_HEARTBEAT_INTERVAL, heartbeat_interval};
pub use orchestrator::{MAX_REPORTED_ERROR_BYTES, Orchestrator, PollOutcome};
pub use plan::{DeployPlan, ImageSource, SourceBuild};
pub use types::{
    HeartbeatAck, Job, JobOutcome, JobPayload, Phase, RUNNING_STATUS, ReportStatus, RuntimeNode,
};
