//! Container engine driver
//!
//! Builds, pushes and removes images with a Docker-compatible CLI
//! (`docker`, `podman`, ...). The binary is configurable.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::config::{RegistryCredentials, RunnerConfig};
use crate::executor::{CommandError, CommandRunner, ProcessCommand};
use crate::pipeline::RunnerError;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(60);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Docker-compatible container engine
pub struct ContainerEngine {
    binary: String,
    runner: Arc<dyn CommandRunner>,
    credentials: Option<RegistryCredentials>,
    build_timeout: Duration,
    push_timeout: Duration,
}

impl ContainerEngine {
    /// Creates an engine driving `binary` with default timeouts
    pub fn new(binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        let defaults = RunnerConfig::default();
        Self {
            binary: binary.into(),
            runner,
            credentials: None,
            build_timeout: defaults.build_timeout,
            push_timeout: defaults.push_timeout,
        }
    }

    /// Creates an engine from the runner configuration
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &RunnerConfig) -> Self {
        Self::new(config.docker_bin.clone(), runner)
            .with_credentials(config.registry_credentials.clone())
            .with_timeouts(config.build_timeout, config.push_timeout)
    }

    /// Sets the registry credentials used by [`ContainerEngine::login`]
    #[must_use]
    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets build and push timeouts
    #[must_use]
    pub fn with_timeouts(mut self, build: Duration, push: Duration) -> Self {
        self.build_timeout = build;
        self.push_timeout = push;
        self
    }

    /// Logs in to `registry`. Does nothing when no credentials are set.
    ///
    /// The password goes over stdin and never appears in the returned
    /// error, which only carries the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Command`] when the login command fails.
    pub async fn login(&self, registry: &str) -> Result<bool, RunnerError> {
        let Some(credentials) = &self.credentials else {
            debug!(registry = %registry, "No registry credentials; skipping login");
            return Ok(false);
        };

        let command = self
            .command()
            .args([
                "login",
                registry,
                "-u",
                credentials.username.as_str(),
                "--password-stdin",
            ])
            .stdin(credentials.password.clone())
            .timeout(LOGIN_TIMEOUT);

        match self.runner.run(&command).await {
            Ok(_) => {
                info!(registry = %registry, user = %credentials.username, "Logged in to registry");
                Ok(true)
            }
            Err(e) => Err(RunnerError::Command(redact_login_failure(e, &command))),
        }
    }

    /// Builds `image` from the Dockerfile in `context`
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Command`] when the build fails or times out.
    pub async fn build(&self, image: &str, context: &Path) -> Result<(), RunnerError> {
        let command = self
            .command()
            .args(["build", "-t", image])
            .arg(context.to_string_lossy())
            .current_dir(context)
            .timeout(self.build_timeout);
        let output = self.runner.run(&command).await?;
        info!(image = %image, duration_ms = output.duration.as_millis(), "Image built");
        Ok(())
    }

    /// Pushes `image`
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Command`] when the push fails or times out.
    pub async fn push(&self, image: &str) -> Result<(), RunnerError> {
        let command = self
            .command()
            .args(["push", image])
            .timeout(self.push_timeout);
        let output = self.runner.run(&command).await?;
        info!(image = %image, duration_ms = output.duration.as_millis(), "Image pushed");
        Ok(())
    }

    /// Force-removes the local copy of `image`
    ///
    /// # Errors
    ///
    /// Returns the command failure; callers treat it as non-fatal.
    pub async fn remove_image(&self, image: &str) -> Result<(), CommandError> {
        let command = self
            .command()
            .args(["rmi", "-f", image])
            .timeout(REMOVE_TIMEOUT);
        self.runner.run(&command).await.map(|_| ())
    }

    fn command(&self) -> ProcessCommand {
        ProcessCommand::new(self.binary.clone())
    }
}

/// Drops the captured output of a failed login: some engines echo the
/// credentials they were given.
fn redact_login_failure(err: CommandError, command: &ProcessCommand) -> CommandError {
    let rendered = command.display();
    match err {
        CommandError::Failed { code, .. } => CommandError::Failed {
            command: rendered,
            code,
            output: format!("registry login failed (exit code {code})"),
        },
        CommandError::TimedOut { timeout, .. } => CommandError::TimedOut {
            command: rendered,
            timeout,
            output: String::new(),
        },
        spawn @ CommandError::Spawn { .. } => spawn,
    }
}
