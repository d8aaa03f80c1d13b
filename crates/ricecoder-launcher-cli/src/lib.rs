//! rclaunch - run a program under a launcher policy from the command line

pub mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use ricecoder_launcher::{
    CancellationMode, CancellationToken, ExceptionPolicy, Launcher, LauncherSettings,
    ProcessConfiguration, ProcessError, ProcessLauncher, ResultValidation, ShellInvocation,
    ShellKind,
};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Exit status used when the process timed out (matches coreutils `timeout`)
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit status used when the launch itself failed
pub const EXIT_LAUNCH_FAILED: i32 = 125;
/// Exit status used when the run was cancelled with Ctrl-C
pub const EXIT_CANCELLED: i32 = 130;

/// Run a program with timeouts, cancellation and output capture
#[derive(Parser, Debug)]
#[command(name = "rclaunch")]
#[command(bin_name = "rclaunch")]
#[command(about = "Run a program with timeouts, cancellation and output capture")]
#[command(version)]
#[command(author = "RiceCoder Contributors")]
pub struct Cli {
    /// Program to run (a script when --shell is given)
    #[arg(value_name = "PROGRAM")]
    pub program: String,

    /// Arguments passed to the program
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Working directory
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Extra environment variable (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Timeout in milliseconds
    #[arg(short, long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// What to do with the process on timeout
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Which errors raised around cancellation are reported
    #[arg(long, value_enum)]
    pub exceptions: Option<ExceptionsArg>,

    /// Grace period after the graceful signal, in milliseconds
    #[arg(long, value_name = "MS")]
    pub grace_ms: Option<u64>,

    /// Run PROGRAM as a script through this shell
    #[arg(long, value_enum)]
    pub shell: Option<ShellArg>,

    /// Fail when the process exits with a nonzero code
    #[arg(long)]
    pub check: bool,

    /// Forward output live instead of buffering it
    #[arg(long, conflicts_with = "json")]
    pub stream: bool,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Launcher settings file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    None,
    Graceful,
    Forceful,
}

impl From<ModeArg> for CancellationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::None => CancellationMode::None,
            ModeArg::Graceful => CancellationMode::Graceful,
            ModeArg::Forceful => CancellationMode::Forceful,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExceptionsArg {
    Suppress,
    Allow,
    AllowIfUnexpected,
}

impl From<ExceptionsArg> for ExceptionPolicy {
    fn from(policy: ExceptionsArg) -> Self {
        match policy {
            ExceptionsArg::Suppress => ExceptionPolicy::SuppressException,
            ExceptionsArg::Allow => ExceptionPolicy::AllowException,
            ExceptionsArg::AllowIfUnexpected => ExceptionPolicy::AllowExceptionIfUnexpected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShellArg {
    Cmd,
    Powershell,
    Posix,
}

impl From<ShellArg> for ShellKind {
    fn from(shell: ShellArg) -> Self {
        match shell {
            ShellArg::Cmd => ShellKind::Cmd,
            ShellArg::Powershell => ShellKind::PowerShell,
            ShellArg::Posix => ShellKind::Posix,
        }
    }
}

/// Parse a `KEY=VALUE` pair
pub fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

impl Cli {
    /// Launcher built from the settings file and environment
    pub fn launcher(&self) -> Result<Launcher> {
        let settings = LauncherSettings::load(self.config.as_deref())
            .context("Failed to load launcher settings")?;
        debug!(?settings, "Loaded launcher settings");
        Ok(Launcher::with_settings(settings))
    }

    /// Configuration for this invocation, layered over the launcher defaults
    pub fn configuration(&self, launcher: &Launcher) -> Result<ProcessConfiguration> {
        let mut builder = match self.shell {
            Some(shell) => {
                if !self.args.is_empty() {
                    bail!("--shell takes a single script; quote it instead of passing ARGS");
                }
                launcher.configure_shell(&ShellInvocation::new(shell.into(), &self.program))
            }
            None => launcher.configure(&self.program).args(&self.args),
        };

        if let Some(dir) = &self.cwd {
            builder = builder.working_dir(dir);
        }
        for (key, value) in &self.env {
            builder = builder.env(key, value);
        }
        if let Some(ms) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(mode) = self.mode {
            builder = builder.cancellation_mode(mode.into());
        }
        if let Some(policy) = self.exceptions {
            builder = builder.exception_policy(policy.into());
        }
        if let Some(ms) = self.grace_ms {
            builder = builder.grace_period(Duration::from_millis(ms));
        }
        if self.check {
            builder = builder.validation(ResultValidation::ExitCodeZero);
        }
        if self.stream {
            // The child reads our stdin directly.
            builder = builder.redirect_stdin(false);
        }

        builder.build().context("Invalid process configuration")
    }
}

/// Map a launch error to the exit status rclaunch reports
pub fn exit_status_for(err: &ProcessError) -> i32 {
    match err {
        ProcessError::NotSuccessful { exit_code, .. } => *exit_code,
        ProcessError::Timeout { .. } | ProcessError::GracefulShutdownTimedOut { .. } => {
            EXIT_TIMEOUT
        }
        ProcessError::Cancelled => EXIT_CANCELLED,
        _ => EXIT_LAUNCH_FAILED,
    }
}

/// Run the invocation; returns the exit status for rclaunch
pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    let launcher = cli.launcher()?;
    let config = cli.configuration(&launcher)?;

    let outcome = if cli.stream {
        stream(&launcher, &config, cancel).await
    } else {
        buffered(&launcher, &config, cli.json, cancel).await
    };

    match outcome {
        Ok(code) => Ok(code),
        Err(err) => {
            let status = exit_status_for(&err);
            eprintln!("rclaunch: {err}");
            Ok(status)
        }
    }
}

async fn buffered(
    launcher: &Launcher,
    config: &ProcessConfiguration,
    json: bool,
    cancel: CancellationToken,
) -> ricecoder_launcher::Result<i32> {
    let result = launcher.run_buffered(config, cancel).await?;

    if json {
        let rendered = serde_json::to_string_pretty(&result)
            .map_err(|e| ProcessError::Io(e.into()))?;
        println!("{rendered}");
    } else {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(result.stdout.as_bytes()).await?;
        stdout.flush().await?;
        let mut stderr = tokio::io::stderr();
        stderr.write_all(result.stderr.as_bytes()).await?;
        stderr.flush().await?;
    }

    Ok(result.result.exit_code)
}

async fn stream(
    launcher: &Launcher,
    config: &ProcessConfiguration,
    cancel: CancellationToken,
) -> ricecoder_launcher::Result<i32> {
    let mut process = launcher.spawn_streaming(config, cancel).await?;

    let stdout = process.take_stdout();
    let stderr = process.take_stderr();
    let forward_out = async {
        if let Some(mut out) = stdout {
            tokio::io::copy(&mut out, &mut tokio::io::stdout()).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let forward_err = async {
        if let Some(mut err) = stderr {
            tokio::io::copy(&mut err, &mut tokio::io::stderr()).await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let (waited, out, err) = tokio::join!(process.wait(), forward_out, forward_err);
    out?;
    err?;
    Ok(waited?.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("KEY=a=b").unwrap(),
            ("KEY".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_string(), String::new()));
        assert!(parse_env("=value").is_err());
        assert!(parse_env("novalue").is_err());
    }

    #[test]
    fn test_parse_full_invocation() {
        let cli = Cli::try_parse_from([
            "rclaunch",
            "--timeout-ms",
            "500",
            "--mode",
            "graceful",
            "--exceptions",
            "allow-if-unexpected",
            "-e",
            "A=1",
            "--check",
            "ls",
            "-la",
            "/tmp",
        ])
        .unwrap();

        assert_eq!(cli.program, "ls");
        assert_eq!(cli.args, ["-la", "/tmp"]);
        assert_eq!(cli.timeout_ms, Some(500));
        assert_eq!(cli.mode, Some(ModeArg::Graceful));
        assert_eq!(cli.exceptions, Some(ExceptionsArg::AllowIfUnexpected));
        assert_eq!(cli.env, [("A".to_string(), "1".to_string())]);
        assert!(cli.check);
    }

    #[test]
    fn test_stream_conflicts_with_json() {
        assert!(Cli::try_parse_from(["rclaunch", "--stream", "--json", "true"]).is_err());
    }

    #[test]
    fn test_configuration_applies_flags() {
        let cli = Cli::try_parse_from([
            "rclaunch",
            "--timeout-ms",
            "750",
            "--mode",
            "forceful",
            "--check",
            "echo",
            "hi",
        ])
        .unwrap();
        let launcher = Launcher::new();
        let config = cli.configuration(&launcher).unwrap();

        assert_eq!(config.arguments(), ["hi"]);
        assert_eq!(config.wait_policy().timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.wait_policy().mode, CancellationMode::Forceful);
        assert_eq!(config.validation(), ResultValidation::ExitCodeZero);
    }

    #[test]
    fn test_shell_rejects_extra_args() {
        let cli = Cli::try_parse_from(["rclaunch", "--shell", "posix", "echo", "extra"]).unwrap();
        assert!(cli.configuration(&Launcher::new()).is_err());
    }

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(exit_status_for(&ProcessError::Timeout { millis: 1 }), EXIT_TIMEOUT);
        assert_eq!(exit_status_for(&ProcessError::Cancelled), EXIT_CANCELLED);
        assert_eq!(
            exit_status_for(&ProcessError::NotSuccessful {
                exit_code: 9,
                file_path: PathBuf::from("x"),
                pid: None,
            }),
            9
        );
        assert_eq!(
            exit_status_for(&ProcessError::InvalidArgument("x".into())),
            EXIT_LAUNCH_FAILED
        );
    }
}
