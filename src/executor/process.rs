//! External process execution
//!
//! Every external tool the runner drives (`git`, the container engine) is
//! invoked through [`CommandRunner`], so timeout handling and the failure
//! surface are the same for all of them:
//!
//! - argv is passed verbatim, never through a shell
//! - stdout and stderr are captured and returned as one text blob
//! - a non-zero exit or an elapsed timeout becomes a [`CommandError`]
//!   carrying the exit code (when there is one) and the captured output
//! - secrets are fed over stdin ([`ProcessCommand::stdin`]) so they never
//!   show up in argv, process listings or error messages
//!
//! There is no retry here; callers decide their own retry policy.
//!
//! ## Example
//!
//! ```rust,no_run
//! use deploy_runner::{CommandRunner, ProcessCommand, ProcessRunner};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), deploy_runner::CommandError> {
//! let cmd = ProcessCommand::new("git")
//!     .args(["--version"])
//!     .timeout(Duration::from_secs(10));
//! let output = ProcessRunner::new().run(&cmd).await?;
//! println!("{}", output.output);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default timeout when a command does not set one
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(900);

/// Upper bound on captured output kept per command (the tail is kept)
pub const MAX_CAPTURED_BYTES: usize = 64 * 1024;

/// How long to wait for output pipes to drain once the child is gone
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of an external command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The process ran and exited non-zero
    #[error("command failed ({code}): {command}\n{output}")]
    Failed {
        /// Rendered command line.
        command: String,
        /// Exit code (`-1` when the process was killed by a signal).
        code: i32,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The process exceeded its timeout and was killed
    #[error("command timed out after {timeout:?}: {command}\n{output}")]
    TimedOut {
        /// Rendered command line.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Output captured before the process was killed.
        output: String,
    },

    /// The process could not be started or waited on
    #[error("failed to run {command}: {message}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying OS error.
        message: String,
    },
}

impl CommandError {
    /// Exit code of the process, if it exited on its own
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            Self::TimedOut { .. } | Self::Spawn { .. } => None,
        }
    }

    /// Output captured before the failure
    #[must_use]
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { output, .. } | Self::TimedOut { output, .. } => output,
            Self::Spawn { .. } => "",
        }
    }

    /// The rendered command line
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            Self::Failed { command, .. }
            | Self::TimedOut { command, .. }
            | Self::Spawn { command, .. } => command,
        }
    }
}

/// Captured result of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Combined stdout followed by stderr
    pub output: String,

    /// Exit code (always 0 for a returned output)
    pub exit_code: i32,

    /// Wall-clock duration of the process
    pub duration: Duration,
}

/// Builder for a single external process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl ProcessCommand {
    /// Creates a command for `program` with no arguments
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Appends one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds an environment variable on top of the inherited environment
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Data written to the child's stdin, after which stdin is closed
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Maximum run time before the child is killed
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program name
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, in order
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Working directory, if set
    #[must_use]
    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Looks up an environment override
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Stdin payload, if any
    #[must_use]
    pub fn stdin_data(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Configured timeout
    #[must_use]
    pub fn time_limit(&self) -> Duration {
        self.timeout
    }

    /// Shell-quoted rendering of program and arguments, for logs and errors.
    ///
    /// Stdin and environment are never part of the rendering.
    #[must_use]
    pub fn display(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

/// Executes external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion, returning its combined output.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the process cannot be spawned, exits
    /// non-zero, or runs past its timeout.
    async fn run(&self, command: &ProcessCommand) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Creates a new process runner
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &ProcessCommand) -> Result<CommandOutput, CommandError> {
        let rendered = command.display();
        let start = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        debug!(command = %rendered, timeout_secs = command.timeout.as_secs(), "Spawning process");

        let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
            command: rendered.clone(),
            message: e.to_string(),
        })?;

        if let (Some(input), Some(mut pipe)) = (&command.stdin, child.stdin.take()) {
            // A child that exits without reading stdin surfaces through its exit code.
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                warn!(command = %rendered, error = %e, "Failed to write process stdin");
            }
            drop(pipe);
        }

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_to_string(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_to_string(s)));

        let status = match tokio::time::timeout(command.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                return Err(CommandError::Spawn {
                    command: rendered,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %rendered, timeout = ?command.timeout, "Process timed out; killing");
                if let Err(e) = child.kill().await {
                    warn!(command = %rendered, error = %e, "Failed to kill timed-out process");
                }
                None
            }
        };

        let output = combine_output(drain(stdout).await, drain(stderr).await);
        let duration = start.elapsed();

        match status {
            None => Err(CommandError::TimedOut {
                command: rendered,
                timeout: command.timeout,
                output,
            }),
            Some(status) if status.success() => {
                debug!(command = %rendered, duration_ms = duration.as_millis(), "Process finished");
                Ok(CommandOutput {
                    output,
                    exit_code: 0,
                    duration,
                })
            }
            Some(status) => Err(CommandError::Failed {
                command: rendered,
                code: status.code().unwrap_or(-1),
                output,
            }),
        }
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "Output pipe closed with error");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(handle: Option<JoinHandle<String>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    // Grandchildren (ssh, buildkit helpers) can keep a pipe open after a kill.
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => String::new(),
    }
}

fn combine_output(stdout: String, stderr: String) -> String {
    let mut combined = stdout;
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    keep_tail(combined, MAX_CAPTURED_BYTES)
}

/// Keeps at most `max` trailing bytes of `text`, cut on a char boundary
pub(crate) fn keep_tail(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[output truncated]\n{}", &text[start..])
}
