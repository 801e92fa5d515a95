//! Runtime agent client
//!
//! One call: tell the agent on the job's runtime node to run a container.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use super::config::RunnerConfig;
use crate::pipeline::RunnerError;

/// Header carrying the agent token
pub const RUNTIME_TOKEN_HEADER: &str = "X-Runtime-Token";

const DEPLOY_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /agent/apps/deploy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// Owning user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Application id
    pub app_id: String,
    /// Image to run
    pub image: String,
    /// Port the container listens on
    pub container_port: u16,
    /// Public base path
    pub base_path: String,
}

/// Something that can start an app container on a runtime node
#[async_trait]
pub trait RuntimeDeployer: Send + Sync {
    /// Deploys `request` through the agent at `agent_base_url` and returns
    /// the agent's JSON answer.
    async fn deploy(
        &self,
        agent_base_url: &str,
        request: &DeployRequest,
    ) -> Result<serde_json::Value, RunnerError>;
}

/// HTTP implementation of [`RuntimeDeployer`]
#[derive(Debug, Clone)]
pub struct HttpRuntimeClient {
    token: String,
    client: reqwest::Client,
}

impl HttpRuntimeClient {
    /// Creates a client authenticating with `token`
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Transport`] when the HTTP client cannot be built.
    pub fn new(token: impl Into<String>) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder()
            .timeout(DEPLOY_TIMEOUT)
            .build()
            .map_err(|e| RunnerError::transport("deploy", e.to_string()))?;
        Ok(Self {
            token: token.into(),
            client,
        })
    }

    /// Creates a client from the runner configuration
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Transport`] when the HTTP client cannot be built.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, RunnerError> {
        Self::new(config.runtime_agent_token.clone())
    }
}

#[async_trait]
impl RuntimeDeployer for HttpRuntimeClient {
    async fn deploy(
        &self,
        agent_base_url: &str,
        request: &DeployRequest,
    ) -> Result<serde_json::Value, RunnerError> {
        let url = format!("{}/agent/apps/deploy", agent_base_url.trim_end_matches('/'));
        debug!(url = %url, app_id = %request.app_id, image = %request.image, "Runtime deploy request");

        let response = self
            .client
            .post(&url)
            .header(RUNTIME_TOKEN_HEADER, &self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| RunnerError::transport("deploy", e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RunnerError::transport("deploy", e.to_string()))?;
        if !status.is_success() {
            return Err(RunnerError::transport(
                "deploy",
                format!("runtime agent answered HTTP {}: {}", status.as_u16(), body.trim()),
            ));
        }

        // The agent answers with a bare object, not the queue envelope.
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) if value.is_object() => {
                info!(app_id = %request.app_id, image = %request.image, "Runtime agent accepted deploy");
                Ok(value)
            }
            Ok(_) | Err(_) => Err(RunnerError::Protocol(format!(
                "runtime deploy returned a non-object response: {}",
                body.trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn request() -> DeployRequest {
        DeployRequest {
            user_id: Some("7".to_string()),
            app_id: "42".to_string(),
            image: "registry/ns/u7-app42:latest".to_string(),
            container_port: 3000,
            base_path: "/apps/42".to_string(),
        }
    }

    #[tokio::test]
    async fn test_deploy_sends_token_and_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/agent/apps/deploy")
                .header(RUNTIME_TOKEN_HEADER, "tok")
                .json_body(json!({
                    "userId": "7",
                    "appId": "42",
                    "image": "registry/ns/u7-app42:latest",
                    "containerPort": 3000,
                    "basePath": "/apps/42"
                }));
            then.status(200).json_body(json!({"containerId": "abc"}));
        });

        let client = HttpRuntimeClient::new("tok").unwrap();
        let answer = client
            .deploy(&format!("{}/", server.base_url()), &request())
            .await
            .unwrap();
        mock.assert();
        assert_eq!(answer["containerId"], "abc");
    }

    #[tokio::test]
    async fn test_non_object_response_is_protocol_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/agent/apps/deploy");
            then.status(200).json_body(json!(["not", "an", "object"]));
        });

        let err = HttpRuntimeClient::new("tok")
            .unwrap()
            .deploy(&server.base_url(), &request())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    #[tokio::test]
    async fn test_plain_text_response_is_protocol_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/agent/apps/deploy");
            then.status(200).body("ok");
        });

        let err = HttpRuntimeClient::new("tok")
            .unwrap()
            .deploy(&server.base_url(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_http_failure_is_transport_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/agent/apps/deploy");
            then.status(401).body("bad token");
        });

        let err = HttpRuntimeClient::new("wrong")
            .unwrap()
            .deploy(&server.base_url(), &request())
            .await
            .unwrap_err();
        match err {
            RunnerError::Transport { operation, message } => {
                assert_eq!(operation, "deploy");
                assert!(message.contains("401"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
