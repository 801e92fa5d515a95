//! Source checkout over SSH
//!
//! Git is driven as an external command with a pinned identity: a single
//! private key, a single known-hosts file and strict host key checking.
//! A shallow single-branch clone is tried first; if that fails (the ref is
//! a commit, or the server refuses shallow fetches) the directory is wiped
//! and a full clone plus checkout is done instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::config::RunnerConfig;
use crate::executor::{CommandRunner, ProcessCommand, recreate_dir};
use crate::pipeline::RunnerError;

const SHALLOW_CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const FULL_CLONE_TIMEOUT: Duration = Duration::from_secs(900);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(300);

/// How a checkout was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// `git clone --depth 1 --branch <ref>` worked
    Shallow,
    /// Fell back to a full clone followed by `git checkout <ref>`
    FullCheckout,
}

/// Clones repositories with a fixed SSH identity
pub struct GitFetcher {
    runner: Arc<dyn CommandRunner>,
    ssh_key: Option<PathBuf>,
    known_hosts: Option<PathBuf>,
}

impl GitFetcher {
    /// Creates a fetcher using `ssh_key` and `known_hosts`
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        ssh_key: Option<PathBuf>,
        known_hosts: Option<PathBuf>,
    ) -> Self {
        Self {
            runner,
            ssh_key,
            known_hosts,
        }
    }

    /// Creates a fetcher from the runner configuration
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &RunnerConfig) -> Self {
        Self::new(
            runner,
            config.git_ssh_key_path.clone(),
            config.git_known_hosts_path.clone(),
        )
    }

    /// The `GIT_SSH_COMMAND` value.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Precondition`] when the key or the known-hosts
    /// path is not configured.
    pub fn ssh_command(&self) -> Result<String, RunnerError> {
        let key = self
            .ssh_key
            .as_deref()
            .ok_or_else(|| RunnerError::precondition("GIT_SSH_KEY_PATH is not configured"))?;
        let known_hosts = self.known_hosts.as_deref().ok_or_else(|| {
            RunnerError::precondition("GIT_KNOWN_HOSTS_PATH is not configured")
        })?;

        let key = key.to_string_lossy();
        let known_hosts = format!("UserKnownHostsFile={}", known_hosts.to_string_lossy());
        Ok(shell_words::join([
            "ssh",
            "-i",
            key.as_ref(),
            "-o",
            known_hosts.as_str(),
            "-o",
            "StrictHostKeyChecking=yes",
        ]))
    }

    /// Clones `repo_url` at `git_ref` into `dest`, which must exist and be
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Precondition`] when SSH settings are missing,
    /// [`RunnerError::Io`] when `dest` cannot be reset between attempts, and
    /// [`RunnerError::Command`] when the fallback clone or checkout fails.
    pub async fn fetch(
        &self,
        repo_url: &str,
        git_ref: &str,
        dest: &Path,
    ) -> Result<FetchMode, RunnerError> {
        let ssh = self.ssh_command()?;
        let dest_arg = dest.to_string_lossy().into_owned();

        let shallow = self
            .git(&ssh)
            .args(["clone", "--depth", "1", "--branch", git_ref, repo_url])
            .arg(dest_arg.clone())
            .timeout(SHALLOW_CLONE_TIMEOUT);
        match self.runner.run(&shallow).await {
            Ok(_) => {
                info!(repo = %repo_url, git_ref = %git_ref, "Shallow clone complete");
                return Ok(FetchMode::Shallow);
            }
            Err(e) => {
                warn!(
                    repo = %repo_url,
                    git_ref = %git_ref,
                    exit_code = ?e.exit_code(),
                    "Shallow clone failed; retrying with a full clone"
                );
            }
        }

        recreate_dir(dest).await?;

        let full = self
            .git(&ssh)
            .args(["clone", repo_url])
            .arg(dest_arg)
            .timeout(FULL_CLONE_TIMEOUT);
        self.runner.run(&full).await?;

        let checkout = self
            .git(&ssh)
            .args(["checkout", git_ref])
            .current_dir(dest)
            .timeout(CHECKOUT_TIMEOUT);
        self.runner.run(&checkout).await?;

        info!(repo = %repo_url, git_ref = %git_ref, "Full clone and checkout complete");
        Ok(FetchMode::FullCheckout)
    }

    fn git(&self, ssh: &str) -> ProcessCommand {
        ProcessCommand::new("git")
            .env("GIT_SSH_COMMAND", ssh)
            .env("GIT_TERMINAL_PROMPT", "0")
    }
}
