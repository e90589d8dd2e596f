//! Common error types for bwsync.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for bwsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cron expression could not be parsed or fires too often.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// The vault client exited with a non-zero status.
    #[error("Command '{command}' failed with exit code {}: {stderr}", display_exit_code(.exit_code))]
    ExternalCommand {
        /// Redacted command line.
        command: String,
        /// Exit code, `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The vault could not be unlocked.
    #[error("Unlock failed: {0}")]
    Unlock(String),

    /// Unlock was requested on an already unlocked session.
    #[error("Vault is already unlocked")]
    AlreadyUnlocked,

    /// An operation requiring an unlocked session was attempted without one.
    #[error("Vault is not unlocked")]
    NotUnlocked,

    /// Export of one vault scope failed.
    #[error("Export of {scope} failed: {source}")]
    Export {
        scope: String,
        #[source]
        source: Box<Error>,
    },

    /// Client archive could not be downloaded or installed.
    #[error("Download error: {0}")]
    Download(String),

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// No client build exists for this platform.
    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    /// A retention pass could not remove or list a directory.
    #[error("Prune error at {}: {source}", .path.display())]
    Prune {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A subprocess exceeded its time limit.
    #[error("Command '{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// The operation was cancelled by shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Wrap an error as the failure of one export scope.
    pub fn export(scope: impl Into<String>, source: Error) -> Self {
        Error::Export {
            scope: scope.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error was caused by shutdown rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Export { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

fn display_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<signal>".to_string(),
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
