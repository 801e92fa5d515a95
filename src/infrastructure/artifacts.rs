//! Post-deploy artifact cleanup
//!
//! Once a freshly built image is deployed, neither the local copy nor the
//! registry tag is needed. Both removals are best effort.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::container::ContainerEngine;
use super::registry::{DeletionOutcome, RegistryClient};

/// What cleanup managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// The local image was removed
    pub local_removed: bool,
    /// Result of the remote deletion, if one was attempted
    pub remote: Option<DeletionOutcome>,
}

impl CleanupReport {
    /// True when both steps finished without anything worth a warning
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.local_removed && self.remote.as_ref().is_none_or(DeletionOutcome::is_benign)
    }
}

/// Removes the artifacts of a built image. Never fails.
#[async_trait]
pub trait ArtifactCleaner: Send + Sync {
    /// Removes `image` locally and from its registry
    async fn cleanup(&self, image: &str) -> CleanupReport;
}

/// [`ArtifactCleaner`] backed by the container engine and the registry API
pub struct ArtifactLifecycle {
    engine: Arc<ContainerEngine>,
    registry: RegistryClient,
}

impl ArtifactLifecycle {
    /// Creates a cleaner
    pub fn new(engine: Arc<ContainerEngine>, registry: RegistryClient) -> Self {
        Self { engine, registry }
    }
}

#[async_trait]
impl ArtifactCleaner for ArtifactLifecycle {
    async fn cleanup(&self, image: &str) -> CleanupReport {
        let local_removed = match self.engine.remove_image(image).await {
            Ok(()) => {
                info!(image = %image, "Removed local image");
                true
            }
            Err(e) => {
                warn!(image = %image, error = %e, "Failed to remove local image");
                false
            }
        };

        let remote = self.registry.delete_image(image).await;
        CleanupReport {
            local_removed,
            remote: Some(remote),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{RegistryCredentials, SkipReason};
    use crate::testing::FakeRunner;

    #[tokio::test]
    async fn test_cleanup_removes_local_and_attempts_remote() {
        let runner = FakeRunner::new();
        let engine = Arc::new(ContainerEngine::new("docker", runner.clone()));
        let cleaner = ArtifactLifecycle::new(engine, RegistryClient::new(None, false).unwrap());

        let report = cleaner.cleanup("r.io/ns/app:v1").await;

        assert!(report.local_removed);
        assert_eq!(
            report.remote,
            Some(DeletionOutcome::Skipped(SkipReason::NoCredentials))
        );
        assert!(report.is_clean());
        assert_eq!(runner.calls()[0].arguments(), ["rmi", "-f", "r.io/ns/app:v1"]);
    }

    #[tokio::test]
    async fn test_local_failure_still_attempts_remote() {
        let runner = FakeRunner::new();
        runner.fail_when("rmi", 1);
        let engine = Arc::new(ContainerEngine::new("docker", runner));
        let registry =
            RegistryClient::new(Some(RegistryCredentials::new("u", "p")), true).unwrap();
        let cleaner = ArtifactLifecycle::new(engine, registry);

        let report = cleaner.cleanup("not-a-registry-ref").await;

        assert!(!report.local_removed);
        assert_eq!(
            report.remote,
            Some(DeletionOutcome::Skipped(SkipReason::Unparseable))
        );
        assert!(!report.is_clean());
    }
}
