//! Result types returned by the launcher

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    config::ResultValidation,
    error::{ProcessError, Result},
    wait::Termination,
    wrapper::{exit_code, ProcessWrapper},
};

/// Exit code and timing of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub pid: u32,
    pub file_path: PathBuf,
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub termination: Termination,
}

impl ProcessResult {
    /// Build from an exited wrapper
    pub(crate) fn from_wrapper(wrapper: &ProcessWrapper, termination: Termination) -> Result<Self> {
        let not_exited =
            || ProcessError::InvalidOperation("process has not exited".to_string());

        let status = wrapper.exit_status().ok_or_else(not_exited)?;
        let start_time = wrapper.start_time().ok_or_else(not_exited)?;
        let exit_time = wrapper.exit_time().ok_or_else(not_exited)?;

        Ok(Self {
            pid: wrapper.pid().unwrap_or(0),
            file_path: wrapper.configuration().target_path().to_path_buf(),
            exit_code: exit_code(status),
            start_time,
            exit_time,
            termination,
        })
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Wall-clock run time
    pub fn elapsed(&self) -> Duration {
        (self.exit_time - self.start_time)
            .to_std()
            .unwrap_or_default()
    }

    /// Apply result validation
    ///
    /// Only processes that exited on their own are checked; a process the
    /// launcher terminated already reported why through its termination.
    pub fn validate(self, validation: ResultValidation) -> Result<Self> {
        match validation {
            ResultValidation::ExitCodeZero
                if self.termination.is_natural() && self.exit_code != 0 =>
            {
                Err(ProcessError::NotSuccessful {
                    exit_code: self.exit_code,
                    file_path: self.file_path,
                    pid: Some(self.pid),
                })
            }
            _ => Ok(self),
        }
    }
}

/// Process result with stdout/stderr captured into memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferedProcessResult {
    #[serde(flatten)]
    pub result: ProcessResult,
    pub stdout: String,
    pub stderr: String,
}

/// Process result carrying the caller's sinks back with byte counts
#[derive(Debug)]
pub struct PipedProcessResult<O, E> {
    pub result: ProcessResult,
    pub stdout: O,
    pub stderr: E,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

impl<O, E> PipedProcessResult<O, E> {
    /// Drop the sinks, keeping the plain result
    pub fn into_result(self) -> ProcessResult {
        self.result
    }
}
