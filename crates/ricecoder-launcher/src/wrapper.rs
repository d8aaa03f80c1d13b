//! Process wrapper owning the OS process handle

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::{
    config::ProcessConfiguration,
    error::{ProcessError, Result},
    shell,
};

/// SIGTERM → SIGKILL escalation delay for process-group kills
const SIGKILL_TIMEOUT_MS: u64 = 200;

/// Lifecycle state of a [`ProcessWrapper`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Started,
    Exited,
}

/// Wrapper around `tokio::process::Child` with lifecycle tracking
///
/// Transitions are one-directional: `NotStarted → Started → Exited`.
pub struct ProcessWrapper {
    config: ProcessConfiguration,
    program: PathBuf,
    child: Option<Child>,
    pid: Option<u32>,
    state: ProcessState,
    start_time: Option<DateTime<Utc>>,
    exit_time: Option<DateTime<Utc>>,
    exit_status: Option<ExitStatus>,
}

impl ProcessWrapper {
    /// Wrap a configuration, launching its target path as given
    pub fn new(config: ProcessConfiguration) -> Self {
        let program = config.target_path().to_path_buf();
        Self::with_program(config, program)
    }

    /// Wrap a configuration with an already resolved program path
    pub fn with_program(config: ProcessConfiguration, program: PathBuf) -> Self {
        Self {
            config,
            program,
            child: None,
            pid: None,
            state: ProcessState::NotStarted,
            start_time: None,
            exit_time: None,
            exit_status: None,
        }
    }

    pub fn configuration(&self) -> &ProcessConfiguration {
        &self.config
    }

    /// Program actually executed
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn exit_time(&self) -> Option<DateTime<Utc>> {
        self.exit_time
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Spawn the process and apply the resource policy
    ///
    /// Must be called from within a tokio runtime. A wrapper starts at most once.
    pub fn start(&mut self) -> Result<u32> {
        if self.state != ProcessState::NotStarted {
            return Err(ProcessError::InvalidOperation(
                "process has already been started".to_string(),
            ));
        }

        self.config.resource_policy().check_platform()?;
        let mut cmd = self.build_command()?;

        debug!(
            program = %self.program.display(),
            args = ?self.config.arguments(),
            "Spawning process"
        );

        let child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: self.config.display_name(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            program: self.config.display_name(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "Failed to get process ID"),
        })?;

        self.child = Some(child);
        self.pid = Some(pid);
        self.state = ProcessState::Started;
        self.start_time = Some(Utc::now());

        info!(pid, program = %self.program.display(), "Process started");

        if let Err(e) = self.apply_resource_policy() {
            warn!(pid, error = %e, "Resource policy failed, killing process");
            if let Some(child) = self.child.as_mut() {
                let _ = child.start_kill();
            }
            return Err(e);
        }

        Ok(pid)
    }

    /// Apply the configured resource policy to the running process
    pub fn apply_resource_policy(&mut self) -> Result<()> {
        match (self.state, self.pid) {
            (ProcessState::Started, Some(pid)) => self.config.resource_policy().apply(pid),
            (ProcessState::NotStarted, _) => Err(ProcessError::InvalidOperation(
                "resource policy cannot be applied before the process starts".to_string(),
            )),
            _ => Err(ProcessError::InvalidOperation(
                "resource policy cannot be applied after the process exited".to_string(),
            )),
        }
    }

    fn build_command(&self) -> Result<Command> {
        let config = &self.config;

        let mut cmd = if config.shell_execute() {
            let (shell, args) = shell::shell_execute_command(&self.program, config.arguments());
            let mut cmd = Command::new(shell);
            cmd.args(args);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(config.arguments());
            cmd
        };

        if let Some(dir) = config.working_dir() {
            cmd.current_dir(dir);
        }

        cmd.envs(config.environment());

        let redirect = config.redirection();
        cmd.stdin(if redirect.stdin || config.input().is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        cmd.stdout(if redirect.stdout {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        cmd.stderr(if redirect.stderr {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        cmd.kill_on_drop(true);

        #[cfg(unix)]
        {
            if config.kill_tree() {
                cmd.process_group(0);
            }
            if let Some(credentials) = config.credentials() {
                let user = nix::unistd::User::from_name(&credentials.user)
                    .map_err(|e| ProcessError::Io(e.into()))?
                    .ok_or_else(|| {
                        ProcessError::InvalidArgument(format!(
                            "unknown user: {}",
                            credentials.user
                        ))
                    })?;
                cmd.uid(user.uid.as_raw());
                cmd.gid(user.gid.as_raw());
            }
        }

        #[cfg(windows)]
        if config.create_no_window() {
            cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
        }

        config.resource_policy().prepare_command(&mut cmd);
        Ok(cmd)
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        self.state == ProcessState::Started && matches!(self.try_wait(), Ok(None))
    }

    /// Poll for exit without blocking
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(status) => {
                self.mark_exited(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Wait for natural exit; cancel safe
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let child = self.child.as_mut().ok_or_else(|| {
            ProcessError::InvalidOperation("process has not been started".to_string())
        })?;
        let status = child.wait().await?;
        self.mark_exited(status);
        Ok(status)
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        if self.state == ProcessState::Exited {
            return;
        }
        let now = Utc::now();
        // Wall clock may step backwards; exit never precedes start.
        let exit = match self.start_time {
            Some(start) if now < start => start,
            _ => now,
        };
        self.exit_time = Some(exit);
        self.exit_status = Some(status);
        self.state = ProcessState::Exited;
        info!(pid = ?self.pid, code = exit_code(status), "Process exited");
    }

    /// Ask the process to shut down cooperatively
    ///
    /// - Unix: SIGINT to the process group (or the process when tree-kill is off)
    /// - Windows: `taskkill /pid <pid>` without `/f`, a close request
    pub async fn interrupt(&mut self) -> Result<()> {
        let pid = self.running_pid()?;
        let Some(pid) = pid else {
            return Ok(());
        };
        debug!(pid, "Sending graceful shutdown signal");

        #[cfg(unix)]
        {
            use nix::sys::signal::Signal;
            signal_unix(pid, Signal::SIGINT, self.config.kill_tree())?;
        }

        #[cfg(windows)]
        {
            let mut args = vec!["/pid".to_string(), pid.to_string()];
            if self.config.kill_tree() {
                args.push("/t".to_string());
            }
            run_taskkill(pid, &args).await?;
        }

        Ok(())
    }

    /// Kill the process, including its tree when configured, and reap it
    ///
    /// - Unix: SIGTERM to the process group, then SIGKILL after a short delay
    /// - Windows: `taskkill /pid <pid> /f /t`
    pub async fn kill(&mut self) -> Result<()> {
        let Some(pid) = self.running_pid()? else {
            return Ok(());
        };
        debug!(pid, tree = self.config.kill_tree(), "Killing process");

        if self.config.kill_tree() {
            #[cfg(unix)]
            {
                use nix::sys::signal::Signal;

                signal_unix(pid, Signal::SIGTERM, true)?;
                if tokio::time::timeout(Duration::from_millis(SIGKILL_TIMEOUT_MS), self.wait())
                    .await
                    .is_err()
                {
                    debug!(pid, "Escalating to SIGKILL");
                }
                // Descendants may outlive the leader; always finish the group.
                signal_unix(pid, Signal::SIGKILL, true)?;
            }

            #[cfg(windows)]
            {
                let args = [
                    "/pid".to_string(),
                    pid.to_string(),
                    "/f".to_string(),
                    "/t".to_string(),
                ];
                if let Err(e) = run_taskkill(pid, &args).await {
                    warn!(pid, error = %e, "taskkill failed, killing process only");
                }
            }
        }

        if let (None, Some(child)) = (self.exit_status, self.child.as_mut()) {
            if let Err(e) = child.start_kill() {
                // Already reaped or exited between the checks.
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(ProcessError::Signal { pid, source: e });
                }
            }
        }

        self.wait().await?;
        Ok(())
    }

    /// Best-effort cleanup: kill if still running and reap
    pub async fn ensure_exited(&mut self) {
        if self.state != ProcessState::Started {
            return;
        }
        if let Err(e) = self.kill().await {
            warn!(pid = ?self.pid, error = %e, "Cleanup kill failed");
        }
    }

    /// Pid of a started, not yet exited process
    fn running_pid(&mut self) -> Result<Option<u32>> {
        match self.state {
            ProcessState::NotStarted => Err(ProcessError::InvalidOperation(
                "process has not been started".to_string(),
            )),
            ProcessState::Exited => Ok(None),
            ProcessState::Started => {
                if self.try_wait()?.is_some() {
                    Ok(None)
                } else {
                    Ok(self.pid)
                }
            }
        }
    }

    /// Take stdin handle
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    /// Take stdout handle
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    /// Take stderr handle
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.as_mut().and_then(|c| c.stderr.take())
    }
}

impl Drop for ProcessWrapper {
    fn drop(&mut self) {
        if self.state == ProcessState::Started {
            // kill_on_drop on the child handles the actual kill and reap.
            debug!(pid = ?self.pid, "Dropping running process");
        }
    }
}

/// Exit code of a status; signal terminations report `128 + signal` on Unix
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_unix(pid: u32, signal: nix::sys::signal::Signal, group: bool) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    let sent = if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    };
    match sent {
        Ok(()) => Ok(()),
        // Gone already.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            source: e.into(),
        }),
    }
}

#[cfg(windows)]
async fn run_taskkill(pid: u32, args: &[String]) -> Result<()> {
    let status = Command::new("taskkill")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|source| ProcessError::Signal { pid, source })?;
    if !status.success() {
        return Err(ProcessError::Signal {
            pid,
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("taskkill exited with {:?}", status.code()),
            ),
        });
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::resource::ResourcePolicy;

    fn config(program: &str, args: &[&str]) -> ProcessConfiguration {
        ProcessConfiguration::builder(program)
            .args(args.iter().copied())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let mut wrapper = ProcessWrapper::new(config("true", &[]));
        assert_eq!(wrapper.state(), ProcessState::NotStarted);

        let pid = wrapper.start().unwrap();
        assert!(pid > 0);
        assert_eq!(wrapper.state(), ProcessState::Started);

        let status = wrapper.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(wrapper.state(), ProcessState::Exited);
        assert!(wrapper.start_time().unwrap() <= wrapper.exit_time().unwrap());
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let mut wrapper = ProcessWrapper::new(config("true", &[]));
        wrapper.start().unwrap();
        assert!(matches!(
            wrapper.start(),
            Err(ProcessError::InvalidOperation(_))
        ));
        wrapper.wait().await.unwrap();
    }

    #[test]
    fn test_policy_before_start_rejected() {
        let config = ProcessConfiguration::builder("true")
            .resource_policy(ResourcePolicy::new().priority_boost(true))
            .build()
            .unwrap();
        let mut wrapper = ProcessWrapper::new(config);
        assert!(matches!(
            wrapper.apply_resource_policy(),
            Err(ProcessError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_is_running() {
        let mut wrapper = ProcessWrapper::new(config("sleep", &["1"]));
        wrapper.start().unwrap();
        assert!(wrapper.is_running());

        wrapper.wait().await.unwrap();
        assert!(!wrapper.is_running());
    }

    #[tokio::test]
    async fn test_kill_reaps_process() {
        let mut wrapper = ProcessWrapper::new(config("sleep", &["10"]));
        wrapper.start().unwrap();

        wrapper.kill().await.unwrap();
        assert_eq!(wrapper.state(), ProcessState::Exited);
        assert!(!wrapper.exit_status().unwrap().success());
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let mut wrapper = ProcessWrapper::new(config("sh", &["-c", "kill -9 $$"]));
        wrapper.start().unwrap();
        let status = wrapper.wait().await.unwrap();
        assert_eq!(exit_code(status), 137);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut wrapper = ProcessWrapper::new(config("/definitely/not/a/program", &[]));
        assert!(matches!(
            wrapper.start(),
            Err(ProcessError::SpawnFailed { .. })
        ));
        assert_eq!(wrapper.state(), ProcessState::NotStarted);
    }
}
