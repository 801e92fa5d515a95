//! Configuration management
//!
//! The runner is configured through environment variables, read once at
//! startup into a [`RunnerConfig`] that is then shared by reference with
//! every component. Nothing else reads the environment.

use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DEPLOY_BASE_URL: &str = "http://127.0.0.1:7002";
const DEFAULT_RUNNER_ID: &str = "runner-01";
const DEFAULT_LEASE_SECONDS: u64 = 30;
const DEFAULT_POLL_SECONDS: f64 = 3.0;
const DEFAULT_RUNTIME_TOKEN: &str = "CHANGE_ME";
const DEFAULT_WORK_ROOT: &str = "/tmp/funai-runner-workdir";
const DEFAULT_DOCKER_BIN: &str = "docker";
const DEFAULT_NAMESPACE: &str = "funai";
const DEFAULT_BUILD_TIMEOUT_SECONDS: u64 = 1800;
const DEFAULT_PUSH_TIMEOUT_SECONDS: u64 = 900;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Invalid configuration value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable could not be parsed
    #[error("invalid value for {name}: '{value}' ({reason})")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
        /// What was expected.
        reason: &'static str,
    },
}

/// Registry username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Registry user
    pub username: String,
    /// Registry password or access token
    pub password: String,
}

impl RegistryCredentials {
    /// Creates a credential pair
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Serialize for RegistryCredentials {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("RegistryCredentials", 2)?;
        state.serialize_field("username", &self.username)?;
        state.serialize_field("password", "***")?;
        state.end()
    }
}

/// Runner configuration
#[derive(Clone, Serialize)]
pub struct RunnerConfig {
    /// Queue service base URL (`DEPLOY_BASE_URL`)
    pub deploy_base_url: String,
    /// Identity sent with every queue call (`RUNNER_ID`)
    pub runner_id: String,
    /// Lease requested on claim and extended per heartbeat (`JOB_LEASE_SECONDS`)
    pub lease_seconds: u64,
    /// Sleep between idle or failed polls (`POLL_SECONDS`)
    #[serde(serialize_with = "serialize_secs")]
    pub poll_interval: Duration,
    /// Runtime agent token (`RUNTIME_AGENT_TOKEN`)
    #[serde(serialize_with = "redact")]
    pub runtime_agent_token: String,
    /// SSH private key for git (`GIT_SSH_KEY_PATH`)
    pub git_ssh_key_path: Option<PathBuf>,
    /// Known-hosts file for git (`GIT_KNOWN_HOSTS_PATH`)
    pub git_known_hosts_path: Option<PathBuf>,
    /// Root of per-app build directories (`RUNNER_WORKDIR`)
    pub work_root: PathBuf,
    /// Container engine binary (`RUNNER_DOCKER_BIN`)
    pub docker_bin: String,
    /// Default image registry (`ACR_REGISTRY`)
    pub registry: Option<String>,
    /// Default image namespace (`ACR_NAMESPACE`)
    pub namespace: String,
    /// Registry credentials (`ACR_USERNAME` + `ACR_PASSWORD`)
    pub registry_credentials: Option<RegistryCredentials>,
    /// Use plain HTTP for registry API calls (`ACR_INSECURE`)
    pub registry_insecure: bool,
    /// Image build timeout (`BUILD_TIMEOUT_SECONDS`)
    #[serde(serialize_with = "serialize_secs")]
    pub build_timeout: Duration,
    /// Image push timeout (`PUSH_TIMEOUT_SECONDS`)
    #[serde(serialize_with = "serialize_secs")]
    pub push_timeout: Duration,
    /// Directory for the rolling log file (`FUNAI_LOG_DIR`)
    pub log_dir: Option<PathBuf>,
    /// Default log filter (`RUNNER_LOG_LEVEL`)
    pub log_level: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            deploy_base_url: DEFAULT_DEPLOY_BASE_URL.to_string(),
            runner_id: DEFAULT_RUNNER_ID.to_string(),
            lease_seconds: DEFAULT_LEASE_SECONDS,
            poll_interval: Duration::from_secs_f64(DEFAULT_POLL_SECONDS),
            runtime_agent_token: DEFAULT_RUNTIME_TOKEN.to_string(),
            git_ssh_key_path: None,
            git_known_hosts_path: None,
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
            docker_bin: DEFAULT_DOCKER_BIN.to_string(),
            registry: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            registry_credentials: None,
            registry_insecure: false,
            build_timeout: Duration::from_secs(DEFAULT_BUILD_TIMEOUT_SECONDS),
            push_timeout: Duration::from_secs(DEFAULT_PUSH_TIMEOUT_SECONDS),
            log_dir: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl RunnerConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a numeric or boolean variable cannot be
    /// parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Blank values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a numeric or boolean variable cannot be
    /// parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let registry_credentials = match (get("ACR_USERNAME"), get("ACR_PASSWORD")) {
            (Some(user), Some(password)) => Some(RegistryCredentials::new(user, password)),
            _ => None,
        };

        Ok(Self {
            deploy_base_url: get("DEPLOY_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.deploy_base_url),
            runner_id: get("RUNNER_ID").unwrap_or(defaults.runner_id),
            lease_seconds: parse_u64("JOB_LEASE_SECONDS", get("JOB_LEASE_SECONDS"))?
                .unwrap_or(defaults.lease_seconds),
            poll_interval: parse_secs_f64("POLL_SECONDS", get("POLL_SECONDS"))?
                .unwrap_or(defaults.poll_interval),
            runtime_agent_token: get("RUNTIME_AGENT_TOKEN")
                .unwrap_or(defaults.runtime_agent_token),
            git_ssh_key_path: get("GIT_SSH_KEY_PATH").map(PathBuf::from),
            git_known_hosts_path: get("GIT_KNOWN_HOSTS_PATH").map(PathBuf::from),
            work_root: get("RUNNER_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_root),
            docker_bin: get("RUNNER_DOCKER_BIN").unwrap_or(defaults.docker_bin),
            registry: get("ACR_REGISTRY"),
            namespace: get("ACR_NAMESPACE").unwrap_or(defaults.namespace),
            registry_credentials,
            registry_insecure: parse_bool("ACR_INSECURE", get("ACR_INSECURE"))?
                .unwrap_or(defaults.registry_insecure),
            build_timeout: parse_u64("BUILD_TIMEOUT_SECONDS", get("BUILD_TIMEOUT_SECONDS"))?
                .map_or(defaults.build_timeout, Duration::from_secs),
            push_timeout: parse_u64("PUSH_TIMEOUT_SECONDS", get("PUSH_TIMEOUT_SECONDS"))?
                .map_or(defaults.push_timeout, Duration::from_secs),
            log_dir: get("FUNAI_LOG_DIR").map(PathBuf::from),
            log_level: get("RUNNER_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("deploy_base_url", &self.deploy_base_url)
            .field("runner_id", &self.runner_id)
            .field("lease_seconds", &self.lease_seconds)
            .field("poll_interval", &self.poll_interval)
            .field("runtime_agent_token", &"***")
            .field("git_ssh_key_path", &self.git_ssh_key_path)
            .field("git_known_hosts_path", &self.git_known_hosts_path)
            .field("work_root", &self.work_root)
            .field("docker_bin", &self.docker_bin)
            .field("registry", &self.registry)
            .field("namespace", &self.namespace)
            .field("registry_credentials", &self.registry_credentials)
            .field("registry_insecure", &self.registry_insecure)
            .field("build_timeout", &self.build_timeout)
            .field("push_timeout", &self.push_timeout)
            .field("log_dir", &self.log_dir)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn parse_u64(name: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    value
        .map(|v| {
            v.parse::<u64>().map_err(|_| ConfigError::Invalid {
                name,
                value: v.clone(),
                reason: "expected a non-negative integer",
            })
        })
        .transpose()
}

fn parse_secs_f64(
    name: &'static str,
    value: Option<String>,
) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|v| {
            v.parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or(ConfigError::Invalid {
                    name,
                    value: v.clone(),
                    reason: "expected a non-negative number of seconds",
                })
        })
        .transpose()
}

fn parse_bool(name: &'static str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    value
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: v.clone(),
                reason: "expected a boolean",
            }),
        })
        .transpose()
}

fn redact<S: Serializer>(_: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("***")
}

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}
