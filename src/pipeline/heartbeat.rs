//! Lease renewal while a job runs
//!
//! A [`LeaseHeartbeat`] owns a background task that extends the job's lease
//! every `max(5s, lease / 2)`. The orchestrator additionally sends phase
//! heartbeats at pipeline milestones through the same handle. All calls to
//! the queue for one job are serialized by an async mutex, so at most one
//! heartbeat is in flight at any time.
//!
//! Failure handling:
//!
//! - a transport failure is logged and the loop keeps going; the lease may
//!   lapse, but the runner never fails a job on its own account
//! - any status other than `RUNNING` means the lease is gone: the loop
//!   stops and [`LeaseHeartbeat::is_revoked`] turns true
//!
//! Revocation does not interrupt the pipeline. The orchestrator checks it
//! between phases and logs it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::Phase;
use crate::infrastructure::{JobQueue, RunnerMetrics};

/// Lower bound on the renewal period
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Renewal period for a lease of `lease_seconds`: half the lease, at least
/// [`MIN_HEARTBEAT_INTERVAL`].
#[must_use]
pub fn heartbeat_interval(lease_seconds: u64) -> Duration {
    Duration::from_millis(lease_seconds.saturating_mul(500)).max(MIN_HEARTBEAT_INTERVAL)
}

struct Shared {
    job_id: String,
    extend_seconds: u64,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<RunnerMetrics>,
    stop: AtomicBool,
    revoked: AtomicBool,
    wake: Notify,
    in_flight: Mutex<()>,
}

impl Shared {
    /// Sends one heartbeat. Returns false once the loop should end.
    async fn beat(&self, phase: Option<Phase>, message: Option<&str>) -> bool {
        let _serialized = self.in_flight.lock().await;
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }

        match self
            .queue
            .heartbeat(&self.job_id, self.extend_seconds, phase, message)
            .await
        {
            Ok(ack) if ack.is_running() => {
                self.metrics.heartbeat(true);
                debug!(job_id = %self.job_id, phase = ?phase, "Lease extended");
                true
            }
            Ok(ack) => {
                self.metrics.heartbeat(true);
                warn!(
                    job_id = %self.job_id,
                    status = ack.status.as_deref().unwrap_or_default(),
                    "Queue no longer reports the job as running; stopping heartbeat"
                );
                self.revoked.store(true, Ordering::SeqCst);
                self.stop.store(true, Ordering::SeqCst);
                self.wake.notify_one();
                false
            }
            Err(e) => {
                self.metrics.heartbeat(false);
                warn!(job_id = %self.job_id, phase = ?phase, error = %e, "Heartbeat failed");
                true
            }
        }
    }
}

/// Handle to the heartbeat task of one job.
///
/// Dropping the handle stops the loop; [`LeaseHeartbeat::stop`] also waits
/// for it to finish.
pub struct LeaseHeartbeat {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl LeaseHeartbeat {
    /// Starts renewing the lease on `job_id`
    pub fn start(
        queue: Arc<dyn JobQueue>,
        job_id: impl Into<String>,
        lease_seconds: u64,
        metrics: Arc<RunnerMetrics>,
    ) -> Self {
        Self::start_with_interval(
            queue,
            job_id,
            lease_seconds,
            heartbeat_interval(lease_seconds),
            metrics,
        )
    }

    /// Like [`LeaseHeartbeat::start`] with an explicit period
    pub fn start_with_interval(
        queue: Arc<dyn JobQueue>,
        job_id: impl Into<String>,
        lease_seconds: u64,
        interval: Duration,
        metrics: Arc<RunnerMetrics>,
    ) -> Self {
        let shared = Arc::new(Shared {
            job_id: job_id.into(),
            extend_seconds: lease_seconds,
            queue,
            metrics,
            stop: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
            wake: Notify::new(),
            in_flight: Mutex::new(()),
        });
        debug!(job_id = %shared.job_id, interval = ?interval, "Starting heartbeat");
        let task = tokio::spawn(run(Arc::clone(&shared), interval));
        Self {
            shared,
            task: Some(task),
        }
    }

    /// Sends a phase heartbeat. Failures are logged, never returned; nothing
    /// is sent once the loop has stopped.
    pub async fn phase(&self, phase: Phase, message: &str) {
        info!(job_id = %self.shared.job_id, phase = %phase, "{message}");
        self.shared.beat(Some(phase), Some(message)).await;
    }

    /// True once the queue reported a status other than `RUNNING`
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.shared.revoked.load(Ordering::SeqCst)
    }

    /// True until the loop is stopped or the lease is revoked
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.shared.stop.load(Ordering::SeqCst)
    }

    /// Stops the loop and waits for the task to exit
    pub async fn stop(mut self) {
        self.signal_stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(job_id = %self.shared.job_id, error = %e, "Heartbeat task ended abnormally");
            }
        }
        debug!(job_id = %self.shared.job_id, "Heartbeat stopped");
    }

    fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

async fn run(shared: Arc<Shared>, interval: Duration) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = shared.wake.notified() => {}
        }
        if shared.stop.load(Ordering::SeqCst) || !shared.beat(None, None).await {
            break;
        }
    }
}
