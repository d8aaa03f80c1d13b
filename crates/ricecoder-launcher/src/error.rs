//! Error types for process launching

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Process launching errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Process exited with a nonzero code while `ExitCodeZero` validation was requested
    #[error("Process {file_path} exited with code {exit_code}")]
    NotSuccessful {
        exit_code: i32,
        file_path: PathBuf,
        pid: Option<u32>,
    },

    /// Invalid argument (empty target path, inconsistent working-set bounds, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Feature used on an OS that cannot provide it
    #[error("Not supported on this platform: {0}")]
    PlatformNotSupported(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Failed to spawn process
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure while piping or waiting
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Process did not exit before the configured timeout
    #[error("Process timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// Wait abandoned through the caller's cancellation token
    #[error("Process wait was cancelled")]
    Cancelled,

    /// Graceful signal was sent but the process kept running
    #[error("Process {pid} still running {millis}ms after graceful shutdown request")]
    GracefulShutdownTimedOut { pid: u32, millis: u64 },

    /// Failed to deliver a signal or kill request
    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Program could not be resolved on PATH
    #[error("Program not found on PATH: {program}")]
    NotFound { program: String },

    /// Launcher settings could not be loaded or are invalid
    #[error("Settings error: {0}")]
    Settings(String),
}

impl ProcessError {
    /// Whether this error is a direct consequence of the launcher cancelling the process
    ///
    /// `Signal` errors are expected only when the target had already exited (`ESRCH`).
    pub fn is_cancellation(&self) -> bool {
        match self {
            ProcessError::Timeout { .. }
            | ProcessError::Cancelled
            | ProcessError::GracefulShutdownTimedOut { .. } => true,
            ProcessError::Signal { source, .. } => is_already_exited(source),
            _ => false,
        }
    }
}

#[cfg(unix)]
fn is_already_exited(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::ESRCH) || err.kind() == io::ErrorKind::InvalidInput
}

#[cfg(not(unix))]
fn is_already_exited(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput || err.kind() == io::ErrorKind::NotFound
}

impl From<config::ConfigError> for ProcessError {
    fn from(err: config::ConfigError) -> Self {
        ProcessError::Settings(err.to_string())
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_cancellation() {
        assert!(ProcessError::Timeout { millis: 10 }.is_cancellation());
        assert!(ProcessError::Cancelled.is_cancellation());
        assert!(!ProcessError::InvalidArgument("x".into()).is_cancellation());
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_error_classification() {
        let gone = ProcessError::Signal {
            pid: 1,
            source: io::Error::from_raw_os_error(nix::libc::ESRCH),
        };
        assert!(gone.is_cancellation());

        let denied = ProcessError::Signal {
            pid: 1,
            source: io::Error::from_raw_os_error(nix::libc::EPERM),
        };
        assert!(!denied.is_cancellation());
    }

    #[test]
    fn test_not_successful_message() {
        let err = ProcessError::NotSuccessful {
            exit_code: 3,
            file_path: PathBuf::from("/bin/false"),
            pid: Some(42),
        };
        assert_eq!(err.to_string(), "Process /bin/false exited with code 3");
    }
}
