//! Exit-wait: races process exit against a timeout and caller cancellation
//!
//! ```text
//! Running ──exit──────────────────────────────▶ ExitedNormally
//!    │
//!    └─timeout/cancel─┬─ Graceful ─ signal ─ exit within grace ─▶ ExitedViaGracefulSignal
//!                     │                    └─ escalate ─────────▶ ExitedViaForcefulKill
//!                     ├─ Forceful ─ kill ───────────────────────▶ ExitedViaForcefulKill
//!                     └─ (errors suppressed) ───────────────────▶ ExitedWithSuppressedError
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ProcessError, Result},
    wrapper::ProcessWrapper,
};

/// Default time a gracefully signalled process gets before escalation
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// What happens to the process when the wait times out or is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationMode {
    /// Timeout is ignored; the wait continues until natural exit
    None,
    /// Interrupt signal (close request on Windows), then wait the grace period
    Graceful,
    /// Kill immediately, tree-kill where supported
    #[default]
    Forceful,
}

/// Which errors raised around cancellation reach the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionPolicy {
    /// Swallow everything; the outcome records that an error occurred
    #[serde(alias = "suppress")]
    SuppressException,
    /// Surface the timeout/cancellation and any error raised while cancelling
    #[default]
    #[serde(alias = "allow")]
    AllowException,
    /// Surface only errors not caused by the cancellation itself
    #[serde(alias = "allow_if_unexpected")]
    AllowExceptionIfUnexpected,
}

/// How a process came to exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum Termination {
    ExitedNormally,
    ExitedViaGracefulSignal,
    ExitedViaForcefulKill,
    ExitedWithSuppressedError(String),
}

impl Termination {
    /// True when the process exited on its own
    pub fn is_natural(&self) -> bool {
        matches!(self, Termination::ExitedNormally)
    }
}

/// Timeout and cancellation behaviour for one launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Option<Duration>,
    pub mode: CancellationMode,
    pub exceptions: ExceptionPolicy,
    /// Secondary wait after the graceful signal
    pub grace: Duration,
    /// Kill the process if it outlives the grace period
    pub escalate: bool,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            mode: CancellationMode::default(),
            exceptions: ExceptionPolicy::default(),
            grace: DEFAULT_GRACE_PERIOD,
            escalate: true,
        }
    }
}

impl WaitPolicy {
    /// Timeout actually raced against the exit
    ///
    /// `CancellationMode::None` ignores any configured timeout.
    pub fn effective_timeout(&self) -> Option<Duration> {
        match (self.timeout, self.mode) {
            (Some(limit), CancellationMode::None) => {
                warn!(
                    timeout_ms = limit.as_millis() as u64,
                    "Timeout configured with cancellation mode None; waiting indefinitely"
                );
                None
            }
            (limit, _) => limit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Timeout(Duration),
    Cancelled,
}

impl Trigger {
    fn error(self) -> ProcessError {
        match self {
            Trigger::Timeout(limit) => ProcessError::Timeout {
                millis: limit.as_millis() as u64,
            },
            Trigger::Cancelled => ProcessError::Cancelled,
        }
    }
}

async fn sleep_opt(limit: Option<Duration>) {
    match limit {
        Some(limit) => sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

/// Wait for `wrapper` to exit under `policy`
///
/// Every path that returns leaves the process exited, except an `Err` from the
/// plain wait itself; callers reap with [`ProcessWrapper::ensure_exited`].
pub async fn wait_for_exit(
    wrapper: &mut ProcessWrapper,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
) -> Result<Termination> {
    let limit = policy.effective_timeout();

    let trigger = tokio::select! {
        status = wrapper.wait() => {
            status?;
            return Ok(Termination::ExitedNormally);
        }
        _ = sleep_opt(limit) => Trigger::Timeout(limit.unwrap_or_default()),
        _ = cancel.cancelled() => Trigger::Cancelled,
    };

    warn!(pid = ?wrapper.pid(), trigger = ?trigger, mode = ?policy.mode, "Cancelling process");

    let mut errors = Vec::new();
    let termination = match policy.mode {
        CancellationMode::None => {
            // Only caller cancellation reaches here; the wait is abandoned.
            wrapper.ensure_exited().await;
            Termination::ExitedViaForcefulKill
        }
        CancellationMode::Graceful => graceful(wrapper, policy, &mut errors).await,
        CancellationMode::Forceful => {
            if let Err(e) = wrapper.kill().await {
                errors.push(e);
            }
            Termination::ExitedViaForcefulKill
        }
    };

    if wrapper.is_running() {
        wrapper.ensure_exited().await;
    }

    resolve(policy.exceptions, trigger, termination, errors)
}

async fn graceful(
    wrapper: &mut ProcessWrapper,
    policy: &WaitPolicy,
    errors: &mut Vec<ProcessError>,
) -> Termination {
    if let Err(e) = wrapper.interrupt().await {
        errors.push(e);
    }

    match timeout(policy.grace, wrapper.wait()).await {
        Ok(Ok(_)) => {
            debug!(pid = ?wrapper.pid(), "Process exited after graceful signal");
            Termination::ExitedViaGracefulSignal
        }
        Ok(Err(e)) => {
            errors.push(e);
            if let Err(e) = wrapper.kill().await {
                errors.push(e);
            }
            Termination::ExitedViaForcefulKill
        }
        Err(_) if policy.escalate => {
            warn!(
                pid = ?wrapper.pid(),
                grace_ms = policy.grace.as_millis() as u64,
                "Process ignored graceful signal, escalating to kill"
            );
            if let Err(e) = wrapper.kill().await {
                errors.push(e);
            }
            Termination::ExitedViaForcefulKill
        }
        Err(_) => {
            errors.push(ProcessError::GracefulShutdownTimedOut {
                pid: wrapper.pid().unwrap_or(0),
                millis: policy.grace.as_millis() as u64,
            });
            wrapper.ensure_exited().await;
            Termination::ExitedViaForcefulKill
        }
    }
}

fn resolve(
    policy: ExceptionPolicy,
    trigger: Trigger,
    termination: Termination,
    errors: Vec<ProcessError>,
) -> Result<Termination> {
    match policy {
        ExceptionPolicy::AllowException => {
            Err(errors.into_iter().next().unwrap_or_else(|| trigger.error()))
        }
        ExceptionPolicy::AllowExceptionIfUnexpected => {
            let mut expected = None;
            for err in errors {
                if !err.is_cancellation() {
                    return Err(err);
                }
                expected.get_or_insert(err);
            }
            Ok(match expected {
                Some(err) => Termination::ExitedWithSuppressedError(err.to_string()),
                None => termination,
            })
        }
        ExceptionPolicy::SuppressException => Ok(match errors.into_iter().next() {
            Some(err) => {
                debug!(error = %err, "Suppressed cancellation error");
                Termination::ExitedWithSuppressedError(err.to_string())
            }
            None => termination,
        }),
    }
}
