//! Deploy job queue client
//!
//! The queue service speaks a JSON envelope `{code, message, data}` over
//! `POST`. A call succeeds only when the transport answers 2xx *and* the
//! envelope's `code` is 200; each endpoint's `data` is decoded into a typed
//! shape in one step.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::config::RunnerConfig;
use crate::pipeline::{HeartbeatAck, Job, Phase, ReportStatus};

/// Envelope `code` that marks success
pub const SUCCESS_CODE: i64 = 200;

const QUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue call failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The request did not complete
    #[error("{operation}: transport error: {message}")]
    Transport {
        /// Queue operation.
        operation: &'static str,
        /// Underlying error.
        message: String,
    },

    /// Non-2xx HTTP status
    #[error("{operation}: HTTP {status}")]
    HttpStatus {
        /// Queue operation.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
    },

    /// The envelope reported a non-success code
    #[error("{operation}: rejected with code {code}: {message}")]
    Rejected {
        /// Queue operation.
        operation: &'static str,
        /// Envelope code.
        code: i64,
        /// Envelope message.
        message: String,
    },

    /// The body was not the expected shape
    #[error("{operation}: malformed response: {message}")]
    Decode {
        /// Queue operation.
        operation: &'static str,
        /// Decoder error.
        message: String,
    },
}

/// The job queue as seen by a runner
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Claims the next job with a lease of `lease_seconds`.
    ///
    /// `Ok(None)` means no job is available.
    async fn claim(&self, lease_seconds: u64) -> Result<Option<Job>, QueueError>;

    /// Extends the lease on `job_id` by `extend_seconds`, optionally
    /// reporting the current phase.
    async fn heartbeat(
        &self,
        job_id: &str,
        extend_seconds: u64,
        phase: Option<Phase>,
        phase_message: Option<&str>,
    ) -> Result<HeartbeatAck, QueueError>;

    /// Reports the terminal status of `job_id`
    async fn report(
        &self,
        job_id: &str,
        status: ReportStatus,
        error_message: Option<&str>,
    ) -> Result<(), QueueError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(alias = "msg")]
    message: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self, operation: &'static str) -> Result<Option<T>, QueueError> {
        if self.code == SUCCESS_CODE {
            Ok(self.data)
        } else {
            Err(QueueError::Rejected {
                operation,
                code: self.code,
                message: self.message.unwrap_or_default(),
            })
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    runner_id: &'a str,
    lease_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    runner_id: &'a str,
    extend_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase_message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest<'a> {
    runner_id: &'a str,
    status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

/// HTTP implementation of [`JobQueue`]
#[derive(Debug, Clone)]
pub struct HttpJobQueue {
    base_url: Url,
    runner_id: String,
    client: reqwest::Client,
}

impl HttpJobQueue {
    /// Creates a client for the queue at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transport`] when `base_url` is not a usable
    /// base URL or the HTTP client cannot be built.
    pub fn new(base_url: &str, runner_id: impl Into<String>) -> Result<Self, QueueError> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| QueueError::Transport {
                operation: "init",
                message: format!("invalid queue base URL '{base_url}'"),
            })?;
        let client = reqwest::Client::builder()
            .timeout(QUEUE_TIMEOUT)
            .build()
            .map_err(|e| QueueError::Transport {
                operation: "init",
                message: e.to_string(),
            })?;
        Ok(Self {
            base_url,
            runner_id: runner_id.into(),
            client,
        })
    }

    /// Creates a client from the runner configuration
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transport`] when the HTTP client cannot be built.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, QueueError> {
        Self::new(&config.deploy_base_url, config.runner_id.clone())
    }

    /// `{base}/deploy/jobs/{segments..}`, each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["deploy", "jobs"]).extend(segments);
        }
        url
    }

    async fn post<B, T>(
        &self,
        operation: &'static str,
        url: Url,
        body: &B,
    ) -> Result<Option<T>, QueueError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        debug!(operation, url = %url, "Queue request");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| QueueError::Transport {
                operation,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::HttpStatus {
                operation,
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| QueueError::Transport {
            operation,
            message: e.to_string(),
        })?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|e| QueueError::Decode {
                operation,
                message: e.to_string(),
            })?;
        envelope.into_data(operation)
    }
}

#[async_trait]
impl JobQueue for HttpJobQueue {
    async fn claim(&self, lease_seconds: u64) -> Result<Option<Job>, QueueError> {
        let body = ClaimRequest {
            runner_id: &self.runner_id,
            lease_seconds,
        };
        let data: Option<serde_json::Value> =
            self.post("claim", self.endpoint(&["claim"]), &body).await?;

        match data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
            Some(value) => Job::from_wire(value)
                .map(Some)
                .map_err(|e| QueueError::Decode {
                    operation: "claim",
                    message: e.to_string(),
                }),
        }
    }

    async fn heartbeat(
        &self,
        job_id: &str,
        extend_seconds: u64,
        phase: Option<Phase>,
        phase_message: Option<&str>,
    ) -> Result<HeartbeatAck, QueueError> {
        let body = HeartbeatRequest {
            runner_id: &self.runner_id,
            extend_seconds,
            phase,
            phase_message,
        };
        let url = self.endpoint(&[job_id, "heartbeat"]);
        let data: Option<HeartbeatAck> = self.post("heartbeat", url, &body).await?;
        Ok(data.unwrap_or_default())
    }

    async fn report(
        &self,
        job_id: &str,
        status: ReportStatus,
        error_message: Option<&str>,
    ) -> Result<(), QueueError> {
        let body = ReportRequest {
            runner_id: &self.runner_id,
            status,
            error_message,
        };
        let url = self.endpoint(&[job_id, "report"]);
        let _: Option<serde::de::IgnoredAny> = self.post("report", url, &body).await?;
        Ok(())
    }
}
