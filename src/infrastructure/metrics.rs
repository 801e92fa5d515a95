//! Metrics collection
//!
//! Process-local counters for the runner loop. Nothing is exported; a
//! snapshot is logged after every job.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the orchestrator and the heartbeat task
#[derive(Debug, Default)]
pub struct RunnerMetrics {
    jobs_claimed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    claim_failures: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeat_failures: AtomicU64,
    report_failures: AtomicU64,
    cleanup_failures: AtomicU64,
}

/// Point-in-time copy of [`RunnerMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub claim_failures: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub report_failures: u64,
    pub cleanup_failures: u64,
}

impl RunnerMetrics {
    /// Creates zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A job was claimed
    pub fn job_claimed(&self) {
        self.jobs_claimed.fetch_add(1, Ordering::Relaxed);
    }

    /// A job finished; `success` is the reported status
    pub fn job_finished(&self, success: bool) {
        if success {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A claim call failed
    pub fn claim_failed(&self) {
        self.claim_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A heartbeat call completed; `ok` is false on transport failure
    pub fn heartbeat(&self, ok: bool) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The terminal report could not be delivered
    pub fn report_failed(&self) {
        self.report_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A cleanup step did not complete
    pub fn cleanup_failed(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            claim_failures: self.claim_failures.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        assert_eq!(RunnerMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_metrics_record() {
        let metrics = RunnerMetrics::new();
        metrics.job_claimed();
        metrics.job_claimed();
        metrics.job_finished(true);
        metrics.job_finished(false);
        metrics.heartbeat(true);
        metrics.heartbeat(false);
        metrics.cleanup_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_claimed, 2);
        assert_eq!(snapshot.jobs_succeeded, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.heartbeats_sent, 2);
        assert_eq!(snapshot.heartbeat_failures, 1);
        assert_eq!(snapshot.cleanup_failures, 1);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["jobs_claimed"], 2);
    }
}
