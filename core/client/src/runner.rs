//! Subprocess invocation of the vault client.
//!
//! Every command runs as a child process with captured output, an
//! environment map scoped to that single invocation, a time limit and a
//! cancellation token. Nothing here mutates the service's own environment.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bwsync_common::{Error, Result, SensitiveString};

const EXEC_BUSY_RETRY_ATTEMPTS: usize = 20;
const EXEC_BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Arguments whose following value must never appear in logs or errors.
const REDACTED_FLAGS: &[&str] = &["--session", "--password"];

/// One client command: arguments plus the environment it alone receives.
#[derive(Debug, Clone)]
pub struct Invocation {
    args: Vec<String>,
    env: Vec<(String, SensitiveString)>,
}

impl Invocation {
    /// Create an invocation from its arguments.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Add an environment variable visible only to this invocation.
    pub fn env(mut self, key: impl Into<String>, value: SensitiveString) -> Self {
        self.env.push((key.into(), value));
        self
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Get the arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Get the per-invocation environment.
    pub fn environment(&self) -> &[(String, SensitiveString)] {
        &self.env
    }

    /// Get the client subcommand (first argument).
    pub fn subcommand(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    /// Command line with secret argument values masked.
    pub fn redacted(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len());
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                parts.push("***");
                mask_next = false;
            } else {
                parts.push(arg.as_str());
                mask_next = REDACTED_FLAGS.contains(&arg.as_str());
            }
        }
        parts.join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes client invocations.
///
/// Implementations return `Ok` for any command that ran to completion,
/// whatever its exit code; interpreting the exit code is the caller's job.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one invocation to completion.
    ///
    /// # Errors
    /// - Process could not be started
    /// - Time limit exceeded (`Error::Timeout`)
    /// - `cancel` fired before completion (`Error::Cancelled`)
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken)
        -> Result<CommandOutput>;
}

/// Runs the vault client executable as a tokio child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    executable: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    /// Create a runner for the given executable and per-command time limit.
    pub fn new(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }

    /// Get the executable path.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Spawn the client, retrying while the executable reports ETXTBSY.
    ///
    /// A freshly written executable can briefly be busy right after install.
    async fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        let mut attempt = 1;
        loop {
            match self.command(invocation).spawn() {
                Ok(child) => return Ok(child),
                Err(error) if is_exec_busy_error(&error) && attempt < EXEC_BUSY_RETRY_ATTEMPTS => {
                    debug!("Client executable busy, retrying spawn ({})", attempt);
                    attempt += 1;
                    tokio::time::sleep(EXEC_BUSY_RETRY_DELAY).await;
                }
                Err(error) => return Err(map_spawn_error(&self.executable, error)),
            }
        }
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in invocation.environment() {
            command.env(key, value.expose());
        }
        command
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        debug!("Spawning client: {}", invocation.redacted());
        let child = self.spawn(invocation).await?;

        // Dropping the future drops the child, and kill_on_drop terminates it.
        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(Error::Timeout {
                        command: invocation.redacted(),
                        after: self.timeout,
                    })
                }
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn map_spawn_error(executable: &Path, error: io::Error) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        return Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("vault client not found: {}", executable.display()),
        ));
    }
    Error::Io(error)
}

fn is_exec_busy_error(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::ExecutableFileBusy || error.raw_os_error() == Some(26)
}
