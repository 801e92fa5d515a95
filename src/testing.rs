//! In-memory doubles for the runner's seams, shared by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::executor::{CommandError, CommandOutput, CommandRunner, ProcessCommand};
use crate::infrastructure::{
    ArtifactCleaner, CleanupReport, DeployRequest, JobQueue, QueueError, RuntimeDeployer,
};
use crate::pipeline::{HeartbeatAck, Job, Phase, ReportStatus, RunnerError};

/// One heartbeat seen by [`FakeQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenHeartbeat {
    pub job_id: String,
    pub extend_seconds: u64,
    pub phase: Option<Phase>,
}

/// One report seen by [`FakeQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenReport {
    pub job_id: String,
    pub status: ReportStatus,
    pub error: Option<String>,
}

/// Scripted queue. Unscripted claims return no job, unscripted heartbeats
/// answer `RUNNING`, reports succeed unless `fail_reports` is set.
#[derive(Default)]
pub struct FakeQueue {
    claims: Mutex<VecDeque<Result<Option<Job>, QueueError>>>,
    claim_calls: AtomicUsize,
    acks: Mutex<VecDeque<Result<HeartbeatAck, QueueError>>>,
    heartbeats: Mutex<Vec<SeenHeartbeat>>,
    reports: Mutex<Vec<SeenReport>>,
    fail_reports: Mutex<bool>,
    heartbeat_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_claim(&self, claim: Result<Option<Job>, QueueError>) {
        self.claims.lock().push_back(claim);
    }

    pub fn push_ack(&self, ack: Result<HeartbeatAck, QueueError>) {
        self.acks.lock().push_back(ack);
    }

    pub fn fail_reports(&self) {
        *self.fail_reports.lock() = true;
    }

    pub fn set_heartbeat_delay(&self, delay: Duration) {
        *self.heartbeat_delay.lock() = Some(delay);
    }

    pub fn heartbeats(&self) -> Vec<SeenHeartbeat> {
        self.heartbeats.lock().clone()
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.heartbeats.lock().iter().filter_map(|h| h.phase).collect()
    }

    pub fn reports(&self) -> Vec<SeenReport> {
        self.reports.lock().clone()
    }

    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub fn transport_error(operation: &'static str) -> QueueError {
    QueueError::Transport {
        operation,
        message: "connection refused".to_string(),
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn claim(&self, _lease_seconds: u64) -> Result<Option<Job>, QueueError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        self.claims.lock().pop_front().unwrap_or(Ok(None))
    }

    async fn heartbeat(
        &self,
        job_id: &str,
        extend_seconds: u64,
        phase: Option<Phase>,
        _phase_message: Option<&str>,
    ) -> Result<HeartbeatAck, QueueError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.heartbeats.lock().push(SeenHeartbeat {
            job_id: job_id.to_string(),
            extend_seconds,
            phase,
        });
        let delay = *self.heartbeat_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let ack = self
            .acks
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HeartbeatAck::with_status("RUNNING")));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ack
    }

    async fn report(
        &self,
        job_id: &str,
        status: ReportStatus,
        error_message: Option<&str>,
    ) -> Result<(), QueueError> {
        self.reports.lock().push(SeenReport {
            job_id: job_id.to_string(),
            status,
            error: error_message.map(str::to_string),
        });
        if *self.fail_reports.lock() {
            return Err(transport_error("report"));
        }
        Ok(())
    }
}

/// Records commands; any command whose rendering contains a registered
/// fragment fails with the given exit code.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<ProcessCommand>>,
    failures: Mutex<Vec<(String, i32)>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_when(&self, fragment: &str, code: i32) {
        self.failures.lock().push((fragment.to_string(), code));
    }

    pub fn calls(&self) -> Vec<ProcessCommand> {
        self.calls.lock().clone()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.calls.lock().iter().map(ProcessCommand::display).collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &ProcessCommand) -> Result<CommandOutput, CommandError> {
        self.calls.lock().push(command.clone());
        let rendered = command.display();
        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(fragment, _)| rendered.contains(fragment.as_str()))
            .map(|(_, code)| *code);
        match failure {
            Some(code) => Err(CommandError::Failed {
                command: rendered,
                code,
                output: "simulated failure".to_string(),
            }),
            None => Ok(CommandOutput {
                output: String::new(),
                exit_code: 0,
                duration: Duration::ZERO,
            }),
        }
    }
}

/// Records deploy requests
#[derive(Default)]
pub struct FakeDeployer {
    requests: Mutex<Vec<(String, DeployRequest)>>,
    failure: Mutex<Option<RunnerError>>,
}

impl FakeDeployer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, err: RunnerError) {
        *self.failure.lock() = Some(err);
    }

    pub fn requests(&self) -> Vec<(String, DeployRequest)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RuntimeDeployer for FakeDeployer {
    async fn deploy(
        &self,
        agent_base_url: &str,
        request: &DeployRequest,
    ) -> Result<serde_json::Value, RunnerError> {
        self.requests
            .lock()
            .push((agent_base_url.to_string(), request.clone()));
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(serde_json::json!({"ok": true})),
        }
    }
}

/// Records cleaned images
#[derive(Default)]
pub struct FakeCleaner {
    images: Mutex<Vec<String>>,
}

impl FakeCleaner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn images(&self) -> Vec<String> {
        self.images.lock().clone()
    }
}

#[async_trait]
impl ArtifactCleaner for FakeCleaner {
    async fn cleanup(&self, image: &str) -> CleanupReport {
        self.images.lock().push(image.to_string());
        CleanupReport {
            local_removed: true,
            remote: None,
        }
    }
}
