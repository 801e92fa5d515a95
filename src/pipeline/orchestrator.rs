//! The claim loop
//!
//! One job at a time: claim, resolve the plan, run the phases, report once,
//! stop the heartbeat, clean up. A failing job turns into a single `FAILED`
//! report and the loop carries on with the next claim.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use super::errors::RunnerError;
use super::heartbeat::LeaseHeartbeat;
use super::plan::{DeployPlan, ImageSource, SourceBuild};
use super::types::{Job, JobOutcome, Phase, ReportStatus};
use crate::executor::{BuildContext, CommandRunner, ProcessRunner, Workspace, keep_tail};
use crate::infrastructure::{
    ArtifactCleaner, ArtifactLifecycle, ContainerEngine, DeployRequest, GitFetcher, HttpJobQueue,
    HttpRuntimeClient, JobQueue, RegistryClient, RunnerConfig, RunnerMetrics, RuntimeDeployer,
};

/// Longest error text sent with a `FAILED` report, not counting the
/// truncation marker
pub const MAX_REPORTED_ERROR_BYTES: usize = 4 * 1024;

/// Result of one claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The queue had no job
    Idle,
    /// The claim call failed
    ClaimFailed,
    /// A job came back without an id and could not be processed
    Malformed,
    /// A job was processed and reported
    Finished(JobOutcome),
}

impl PollOutcome {
    /// True when the loop should claim again right away
    #[must_use]
    pub fn claim_again(&self) -> bool {
        matches!(self, Self::Finished(outcome) if outcome.is_success())
    }
}

/// Runs claimed jobs through clone, build, push and deploy
pub struct Orchestrator {
    config: Arc<RunnerConfig>,
    queue: Arc<dyn JobQueue>,
    deployer: Arc<dyn RuntimeDeployer>,
    git: GitFetcher,
    engine: ContainerEngine,
    cleaner: Arc<dyn ArtifactCleaner>,
    workspace: Workspace,
    metrics: Arc<RunnerMetrics>,
}

impl Orchestrator {
    /// Wires an orchestrator from its collaborators
    pub fn new(
        config: Arc<RunnerConfig>,
        queue: Arc<dyn JobQueue>,
        deployer: Arc<dyn RuntimeDeployer>,
        runner: Arc<dyn CommandRunner>,
        cleaner: Arc<dyn ArtifactCleaner>,
    ) -> Self {
        Self {
            git: GitFetcher::from_config(Arc::clone(&runner), &config),
            engine: ContainerEngine::from_config(runner, &config),
            workspace: Workspace::new(config.work_root.clone()),
            metrics: Arc::new(RunnerMetrics::new()),
            config,
            queue,
            deployer,
            cleaner,
        }
    }

    /// Wires the production HTTP clients and real processes
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Transport`] when an HTTP client cannot be built.
    pub fn from_config(config: Arc<RunnerConfig>) -> Result<Self, RunnerError> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let queue = Arc::new(HttpJobQueue::from_config(&config)?);
        let deployer = Arc::new(HttpRuntimeClient::from_config(&config)?);
        let registry = RegistryClient::from_config(&config)
            .map_err(|e| RunnerError::transport("registry", e.to_string()))?;
        let cleaner = Arc::new(ArtifactLifecycle::new(
            Arc::new(ContainerEngine::from_config(Arc::clone(&runner), &config)),
            registry,
        ));
        Ok(Self::new(config, queue, deployer, runner, cleaner))
    }

    /// Counters for this orchestrator
    #[must_use]
    pub fn metrics(&self) -> &Arc<RunnerMetrics> {
        &self.metrics
    }

    /// Claims and processes jobs until `shutdown` turns true.
    ///
    /// Shutdown is only observed between jobs; a job in flight always runs
    /// to its report.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            runner_id = %self.config.runner_id,
            queue = %self.config.deploy_base_url,
            lease_seconds = self.config.lease_seconds,
            "Runner started"
        );

        while !*shutdown.borrow() {
            if self.poll_once().await.claim_again() {
                continue;
            }

            let sleep = tokio::time::sleep(self.config.poll_interval);
            tokio::pin!(sleep);
            tokio::select! {
                () = &mut sleep => {}
                changed = shutdown.changed() => {
                    // Nobody can signal shutdown any more; keep polling.
                    if changed.is_err() {
                        sleep.await;
                    }
                }
            }
        }

        info!(metrics = ?self.metrics.snapshot(), "Runner stopped");
    }

    /// Makes one claim attempt and processes the job, if any
    pub async fn poll_once(&self) -> PollOutcome {
        let job = match self.queue.claim(self.config.lease_seconds).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("No job available");
                return PollOutcome::Idle;
            }
            Err(e) => {
                self.metrics.claim_failed();
                warn!(error = %e, "Claim failed");
                return PollOutcome::ClaimFailed;
            }
        };

        let Some(job_id) = job.id.clone() else {
            warn!(app_id = ?job.payload.app_id, "Claimed job has no id; skipping");
            return PollOutcome::Malformed;
        };

        let span = info_span!("job", job_id = %job_id);
        PollOutcome::Finished(self.process(job_id, job).instrument(span).await)
    }

    async fn process(&self, job_id: String, job: Job) -> JobOutcome {
        self.metrics.job_claimed();
        let heartbeat = LeaseHeartbeat::start(
            Arc::clone(&self.queue),
            job_id.clone(),
            self.config.lease_seconds,
            Arc::clone(&self.metrics),
        );
        heartbeat.phase(Phase::Claimed, "job claimed").await;

        let plan = DeployPlan::resolve(&job, &self.config);
        let image = plan.as_ref().ok().map(|p| p.image().to_string());
        let result = match &plan {
            Ok(plan) => self.execute(plan, &heartbeat).await,
            Err(e) => Err(e.clone()),
        };

        let (status, error) = match &result {
            Ok(_) => (ReportStatus::Succeeded, None),
            Err(e) => {
                warn!(category = e.category(), error = %e, "Job failed");
                (
                    ReportStatus::Failed,
                    Some(failure_message(e)),
                )
            }
        };

        let reported = match self.queue.report(&job_id, status, error.as_deref()).await {
            Ok(()) => {
                info!(phase = %Phase::Reported, status = %status, "Job reported");
                true
            }
            Err(e) => {
                self.metrics.report_failed();
                warn!(status = %status, error = %e, "Failed to report job outcome");
                false
            }
        };
        if heartbeat.is_revoked() {
            warn!("Lease was revoked while the job ran");
        }
        heartbeat.stop().await;

        if let Ok(context) = &result
            && context.built_locally
        {
            let report = self.cleaner.cleanup(&context.image).await;
            if !report.is_clean() {
                self.metrics.cleanup_failed();
            }
        }

        self.metrics.job_finished(status.is_success());
        info!(metrics = ?self.metrics.snapshot(), "Job finished");

        JobOutcome {
            job_id,
            status,
            reported,
            image,
            error,
        }
    }

    async fn execute(
        &self,
        plan: &DeployPlan,
        heartbeat: &LeaseHeartbeat,
    ) -> Result<BuildContext, RunnerError> {
        let context = match &plan.source {
            ImageSource::Supplied(image) => {
                info!(image = %image, "Using supplied image; nothing to build");
                BuildContext::supplied(image.clone())
            }
            ImageSource::Build(build) => self.build_from_source(plan, build, heartbeat).await?,
        };

        checkpoint(
            heartbeat,
            Phase::Deploy,
            &format!("deploying {} to {}", context.image, plan.agent_base_url),
        )
        .await;
        let request = DeployRequest {
            user_id: plan.user_id.clone(),
            app_id: plan.app_id.clone(),
            image: context.image.clone(),
            container_port: plan.container_port,
            base_path: plan.base_path.clone(),
        };
        self.deployer.deploy(&plan.agent_base_url, &request).await?;

        Ok(context)
    }

    async fn build_from_source(
        &self,
        plan: &DeployPlan,
        build: &SourceBuild,
        heartbeat: &LeaseHeartbeat,
    ) -> Result<BuildContext, RunnerError> {
        // Settle every precondition before touching the filesystem.
        self.git.ssh_command()?;
        self.workspace.app_dir(&plan.app_id)?;

        checkpoint(
            heartbeat,
            Phase::Clone,
            &format!("cloning {}@{}", build.repo_url, build.git_ref),
        )
        .await;
        let work_dir = self.workspace.prepare(&plan.app_id).await?;
        let mode = self
            .git
            .fetch(&build.repo_url, &build.git_ref, &work_dir)
            .await?;
        debug!(mode = ?mode, dir = %work_dir.display(), "Source ready");

        self.engine.login(&build.registry).await?;

        checkpoint(heartbeat, Phase::Build, &format!("building {}", build.image)).await;
        self.engine.build(&build.image, &work_dir).await?;

        checkpoint(heartbeat, Phase::Push, &format!("pushing {}", build.image)).await;
        self.engine.push(&build.image).await?;

        Ok(BuildContext::built(work_dir, build.image.clone()))
    }
}

/// Error text for a `FAILED` report: the first line (what failed, exit
/// code) is kept, and the tail of the output behind it.
fn failure_message(error: &RunnerError) -> String {
    let text = error.to_string();
    if text.len() <= MAX_REPORTED_ERROR_BYTES {
        return text;
    }
    let Some(newline) = text.find('\n') else {
        return keep_tail(text, MAX_REPORTED_ERROR_BYTES);
    };

    let mut head_len = newline.min(MAX_REPORTED_ERROR_BYTES / 4);
    while !text.is_char_boundary(head_len) {
        head_len -= 1;
    }
    let tail = keep_tail(
        text[newline + 1..].to_string(),
        MAX_REPORTED_ERROR_BYTES - head_len,
    );
    format!("{}\n{tail}", &text[..head_len])
}

/// Phase boundary: note a lost lease, then send the phase heartbeat
async fn checkpoint(heartbeat: &LeaseHeartbeat, phase: Phase, message: &str) {
    if heartbeat.is_revoked() {
        warn!(phase = %phase, "Lease revoked; continuing without renewal");
    }
    heartbeat.phase(phase, message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandError;
    use crate::infrastructure::RegistryCredentials;
    use crate::pipeline::HeartbeatAck;
    use crate::testing::{FakeCleaner, FakeDeployer, FakeQueue, FakeRunner, transport_error};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        queue: Arc<FakeQueue>,
        runner: Arc<FakeRunner>,
        deployer: Arc<FakeDeployer>,
        cleaner: Arc<FakeCleaner>,
        orchestrator: Orchestrator,
        work_root: TempDir,
    }

    fn config(work_root: &TempDir) -> RunnerConfig {
        RunnerConfig {
            registry: Some("registry".to_string()),
            namespace: "ns".to_string(),
            git_ssh_key_path: Some(PathBuf::from("/keys/id_ed25519")),
            git_known_hosts_path: Some(PathBuf::from("/keys/known_hosts")),
            work_root: work_root.path().to_path_buf(),
            ..RunnerConfig::default()
        }
    }

    fn harness_with(edit: impl FnOnce(&mut RunnerConfig)) -> Harness {
        let work_root = TempDir::new().unwrap();
        let mut config = config(&work_root);
        edit(&mut config);

        let queue = FakeQueue::new();
        let runner = FakeRunner::new();
        let deployer = FakeDeployer::new();
        let cleaner = FakeCleaner::new();
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            queue.clone(),
            deployer.clone(),
            runner.clone(),
            cleaner.clone(),
        );
        Harness {
            queue,
            runner,
            deployer,
            cleaner,
            orchestrator,
            work_root,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn source_job() -> Job {
        serde_json::from_value(json!({
            "id": 1001,
            "runtimeNode": {"agentBaseUrl": "http://10.0.0.5:7005"},
            "payload": {
                "appId": "42",
                "userId": "7",
                "repoSshUrl": "git@h:org/r.git",
                "gitRef": "main"
            }
        }))
        .unwrap()
    }

    fn finished(outcome: PollOutcome) -> JobOutcome {
        match outcome {
            PollOutcome::Finished(outcome) => outcome,
            other => panic!("expected a processed job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_source_build_scenario() {
        let h = harness();
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(outcome.is_success());
        assert!(outcome.reported);
        assert_eq!(outcome.job_id, "1001");
        assert_eq!(outcome.image.as_deref(), Some("registry/ns/u7-app42:latest"));

        let app_dir = h.work_root.path().join("app-42");
        let app_dir = app_dir.to_string_lossy().into_owned();
        let calls = h.runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].program(), "git");
        assert_eq!(
            calls[0].arguments(),
            [
                "clone",
                "--depth",
                "1",
                "--branch",
                "main",
                "git@h:org/r.git",
                app_dir.as_str()
            ]
        );
        assert_eq!(
            calls[1].arguments(),
            ["build", "-t", "registry/ns/u7-app42:latest", app_dir.as_str()]
        );
        assert_eq!(calls[2].arguments(), ["push", "registry/ns/u7-app42:latest"]);

        let requests = h.deployer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "http://10.0.0.5:7005");
        assert_eq!(
            requests[0].1,
            DeployRequest {
                user_id: Some("7".to_string()),
                app_id: "42".to_string(),
                image: "registry/ns/u7-app42:latest".to_string(),
                container_port: 3000,
                base_path: "/apps/42".to_string(),
            }
        );

        let reports = h.queue.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ReportStatus::Succeeded);
        assert_eq!(reports[0].error, None);

        assert_eq!(
            h.queue.phases(),
            [
                Phase::Claimed,
                Phase::Clone,
                Phase::Build,
                Phase::Push,
                Phase::Deploy
            ]
        );
        assert_eq!(h.cleaner.images(), ["registry/ns/u7-app42:latest"]);
        let snapshot = h.orchestrator.metrics().snapshot();
        assert_eq!(snapshot.jobs_succeeded, 1);
        assert_eq!(snapshot.cleanup_failures, 0);
    }

    #[tokio::test]
    async fn test_supplied_image_runs_no_commands() {
        let h = harness_with(|c| c.registry = None);
        let mut job = source_job();
        job.payload.image = Some("docker.io/library/nginx:1.27".to_string());
        h.queue.push_claim(Ok(Some(job)));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(outcome.is_success());
        assert!(h.runner.calls().is_empty());
        assert!(h.cleaner.images().is_empty());
        assert_eq!(h.deployer.requests()[0].1.image, "docker.io/library/nginx:1.27");
        assert_eq!(h.queue.phases(), [Phase::Claimed, Phase::Deploy]);
    }

    #[tokio::test]
    async fn test_empty_claim_has_no_side_effects() {
        let h = harness();

        assert_eq!(h.orchestrator.poll_once().await, PollOutcome::Idle);
        assert!(h.queue.heartbeats().is_empty());
        assert!(h.queue.reports().is_empty());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_claim_failure_is_counted() {
        let h = harness();
        h.queue.push_claim(Err(transport_error("claim")));

        assert_eq!(h.orchestrator.poll_once().await, PollOutcome::ClaimFailed);
        assert_eq!(h.orchestrator.metrics().snapshot().claim_failures, 1);
    }

    #[tokio::test]
    async fn test_job_without_id_is_skipped() {
        let h = harness();
        let mut job = source_job();
        job.id = None;
        h.queue.push_claim(Ok(Some(job)));

        assert_eq!(h.orchestrator.poll_once().await, PollOutcome::Malformed);
        assert!(h.queue.heartbeats().is_empty());
        assert!(h.queue.reports().is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_reports_failed_once() {
        let h = harness();
        h.runner.fail_when("build", 1);
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(!outcome.is_success());
        let reports = h.queue.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ReportStatus::Failed);
        assert!(reports[0].error.as_deref().unwrap().contains("command failed (1)"));
        assert!(h.deployer.requests().is_empty());
        assert!(h.cleaner.images().is_empty());
        assert_eq!(h.queue.phases(), [Phase::Claimed, Phase::Clone, Phase::Build]);
    }

    #[tokio::test]
    async fn test_missing_registry_fails_before_clone() {
        let h = harness_with(|c| c.registry = None);
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(outcome.error.as_deref().unwrap().contains("ACR_REGISTRY"));
        assert_eq!(outcome.image, None);
        assert!(h.runner.calls().is_empty());
        assert!(!h.work_root.path().join("app-42").exists());
        assert_eq!(h.queue.phases(), [Phase::Claimed]);
    }

    #[tokio::test]
    async fn test_missing_ssh_key_fails_before_any_side_effect() {
        let h = harness_with(|c| c.git_ssh_key_path = None);
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(outcome.error.as_deref().unwrap().contains("GIT_SSH_KEY_PATH"));
        assert!(h.runner.calls().is_empty());
        assert!(!h.work_root.path().join("app-42").exists());
    }

    #[tokio::test]
    async fn test_deploy_protocol_error_skips_cleanup() {
        let h = harness();
        h.deployer
            .fail_with(RunnerError::Protocol("runtime deploy returned a non-object response".into()));
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert_eq!(outcome.status, ReportStatus::Failed);
        assert_eq!(h.runner.calls().len(), 3);
        assert!(h.cleaner.images().is_empty());
    }

    #[tokio::test]
    async fn test_failed_success_report_is_not_retried() {
        let h = harness();
        h.queue.fail_reports();
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(outcome.is_success());
        assert!(!outcome.reported);
        assert_eq!(h.queue.reports().len(), 1);
        assert_eq!(h.cleaner.images().len(), 1);
        assert_eq!(h.orchestrator.metrics().snapshot().report_failures, 1);
    }

    #[tokio::test]
    async fn test_login_runs_before_build_with_credentials() {
        let h = harness_with(|c| {
            c.registry_credentials = Some(RegistryCredentials::new("robot", "pw"));
        });
        h.queue.push_claim(Ok(Some(source_job())));

        finished(h.orchestrator.poll_once().await);

        let calls = h.runner.calls();
        assert_eq!(calls[1].arguments()[0], "login");
        assert_eq!(calls[1].arguments()[1], "registry");
        assert_eq!(calls[1].stdin_data(), Some("pw"));
        assert_eq!(calls[2].arguments()[0], "build");
    }

    #[tokio::test]
    async fn test_login_failure_fails_job_without_leaking_password() {
        let h = harness_with(|c| {
            c.registry_credentials = Some(RegistryCredentials::new("robot", "pw-secret"));
        });
        h.runner.fail_when("login", 1);
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        let error = outcome.error.unwrap();
        assert!(!error.contains("pw-secret"));
        assert!(h.runner.rendered().iter().all(|c| !c.contains("build")));
    }

    #[tokio::test]
    async fn test_revoked_lease_does_not_preempt_pipeline() {
        let h = harness();
        h.queue.push_ack(Ok(HeartbeatAck::with_status("CANCELED")));
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert!(outcome.is_success());
        assert_eq!(h.runner.calls().len(), 3);
        assert_eq!(h.queue.reports().len(), 1);
        // Only the CLAIMED heartbeat went out; later phases were dropped.
        assert_eq!(h.queue.phases(), [Phase::Claimed]);
    }

    #[tokio::test]
    async fn test_long_errors_are_truncated() {
        let h = harness();
        h.deployer.fail_with(RunnerError::Command(CommandError::Failed {
            command: "x".to_string(),
            code: 1,
            output: "e".repeat(3 * MAX_REPORTED_ERROR_BYTES),
        }));
        h.queue.push_claim(Ok(Some(source_job())));

        let outcome = finished(h.orchestrator.poll_once().await);
        let error = outcome.error.unwrap();
        assert!(error.starts_with("command failed (1): x\n[output truncated]\n"));
        assert!(error.ends_with("eee"));
        assert!(error.len() < MAX_REPORTED_ERROR_BYTES + 64);
    }

    #[tokio::test]
    async fn test_undecodable_job_is_reported_failed() {
        let h = harness();
        let job = Job::from_wire(json!({
            "id": 55,
            "runtimeNode": {"agentBaseUrl": "http://10.0.0.5:7005"},
            "payload": {"appId": "42", "image": "r/ns/app:1", "containerPort": "eighty"}
        }))
        .unwrap();
        h.queue.push_claim(Ok(Some(job)));

        let outcome = finished(h.orchestrator.poll_once().await);

        assert_eq!(outcome.job_id, "55");
        let reports = h.queue.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job_id, "55");
        assert_eq!(reports[0].status, ReportStatus::Failed);
        assert!(reports[0].error.as_deref().unwrap().contains("invalid port 'eighty'"));
        assert!(h.deployer.requests().is_empty());
        assert_eq!(h.queue.phases(), [Phase::Claimed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_loop_polls_until_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);

        tokio::join!(h.orchestrator.run(rx), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            tx.send(true).unwrap();
        });

        // Claims at 0s, 3s, 6s and 9s, then shutdown during the sleep.
        assert_eq!(h.queue.claim_calls(), 4);
        assert!(h.queue.reports().is_empty());
    }
}
