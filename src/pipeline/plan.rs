//! Resolution of a claimed job into a concrete deploy plan
//!
//! All field validation happens here, before the first side effect: a job
//! that is missing something fails without cloning, building or deploying.

use super::errors::RunnerError;
use super::types::Job;
use crate::infrastructure::RunnerConfig;

/// Port the app listens on when the payload does not say
pub const DEFAULT_CONTAINER_PORT: u16 = 3000;

/// Ref checked out when the payload does not say
pub const DEFAULT_GIT_REF: &str = "main";

/// Image tag used when the payload does not say
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Where the deployed image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Use the payload's image verbatim; nothing is built
    Supplied(String),
    /// Clone, build and push
    Build(SourceBuild),
}

/// Inputs of a build-from-source run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBuild {
    /// SSH URL of the repository
    pub repo_url: String,
    /// Branch, tag or commit to build
    pub git_ref: String,
    /// Registry the image is pushed to
    pub registry: String,
    /// Full image reference `{registry}/{namespace}/u{user}-app{app}:{tag}`
    pub image: String,
}

/// Everything the orchestrator needs to run one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployPlan {
    /// Queue job id
    pub job_id: String,
    /// Application id
    pub app_id: String,
    /// Owning user id, when known
    pub user_id: Option<String>,
    /// Runtime agent base URL
    pub agent_base_url: String,
    /// Container port
    pub container_port: u16,
    /// Public base path of the app
    pub base_path: String,
    /// Image source
    pub source: ImageSource,
}

impl DeployPlan {
    /// Resolves `job` against the runner configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Precondition`] when a required field is
    /// missing: job id, appId, agentBaseUrl, and for source builds the
    /// repository URL, userId and a registry.
    pub fn resolve(job: &Job, config: &RunnerConfig) -> Result<Self, RunnerError> {
        let payload = &job.payload;

        let job_id = require(job.id.as_deref(), "job id")?;
        if let Some(reason) = &job.malformed {
            return Err(RunnerError::Protocol(format!("malformed job: {reason}")));
        }
        let app_id = require(payload.app_id.as_deref(), "payload.appId")?;
        let agent_base_url = require(
            job.runtime_node.agent_base_url.as_deref(),
            "runtimeNode.agentBaseUrl",
        )?;

        let source = match payload.image.as_deref() {
            Some(image) => ImageSource::Supplied(image.to_string()),
            None => {
                let registry = payload
                    .acr_registry
                    .as_deref()
                    .or(config.registry.as_deref())
                    .ok_or_else(|| {
                        RunnerError::precondition(
                            "no registry configured (ACR_REGISTRY is required when payload.image is not provided)",
                        )
                    })?
                    .trim_end_matches('/')
                    .to_string();
                let namespace = payload
                    .acr_namespace
                    .as_deref()
                    .unwrap_or(&config.namespace)
                    .trim_matches('/');
                let repo_url = require(payload.repo_ssh_url.as_deref(), "payload.repoSshUrl")?;
                let user_id = require(payload.user_id.as_deref(), "payload.userId")?;
                let tag = payload.image_tag.as_deref().unwrap_or(DEFAULT_IMAGE_TAG);

                ImageSource::Build(SourceBuild {
                    repo_url,
                    git_ref: payload
                        .git_ref
                        .clone()
                        .unwrap_or_else(|| DEFAULT_GIT_REF.to_string()),
                    image: format!("{registry}/{namespace}/u{user_id}-app{app_id}:{tag}"),
                    registry,
                })
            }
        };

        Ok(Self {
            base_path: payload
                .base_path
                .clone()
                .unwrap_or_else(|| format!("/apps/{app_id}")),
            container_port: payload.container_port.unwrap_or(DEFAULT_CONTAINER_PORT),
            user_id: payload.user_id.clone(),
            job_id,
            app_id,
            agent_base_url,
            source,
        })
    }

    /// The image that will be deployed
    #[must_use]
    pub fn image(&self) -> &str {
        match &self.source {
            ImageSource::Supplied(image) => image,
            ImageSource::Build(build) => &build.image,
        }
    }

    /// True when the runner itself builds the image
    #[must_use]
    pub fn builds_from_source(&self) -> bool {
        matches!(self.source, ImageSource::Build(_))
    }
}

fn require(value: Option<&str>, field: &str) -> Result<String, RunnerError> {
    value
        .map(str::to_string)
        .ok_or_else(|| RunnerError::precondition(format!("missing {field}")))
}
