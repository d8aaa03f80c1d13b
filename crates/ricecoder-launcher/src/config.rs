//! Process configuration
//!
//! [`ProcessConfiguration`] is an immutable description of what to launch.
//! It is produced by [`ProcessConfigurationBuilder::build`], which validates
//! the combination of settings once so that every launch path can rely on it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use encoding_rs::{Encoding, UTF_8};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ProcessError, Result},
    resource::ResourcePolicy,
    wait::{CancellationMode, ExceptionPolicy, WaitPolicy},
};

/// Default window given to pipes to drain after the process exits
pub const DEFAULT_PIPE_DRAIN: Duration = Duration::from_secs(2);

/// How a finished process is checked before its result is returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultValidation {
    /// Any exit code is accepted
    #[default]
    None,
    /// Nonzero exit codes raise [`ProcessError::NotSuccessful`]
    ExitCodeZero,
}

/// Account the child runs as
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub domain: Option<String>,
}

impl Credentials {
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            domain: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("domain", &self.domain)
            .finish()
    }
}

/// Which standard streams are connected to the launcher instead of inherited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRedirection {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for StreamRedirection {
    fn default() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
        }
    }
}

impl StreamRedirection {
    pub fn any(&self) -> bool {
        self.stdin || self.stdout || self.stderr
    }
}

/// Character encodings used for the three standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEncodings {
    pub stdin: &'static Encoding,
    pub stdout: &'static Encoding,
    pub stderr: &'static Encoding,
}

impl Default for StreamEncodings {
    fn default() -> Self {
        Self {
            stdin: UTF_8,
            stdout: UTF_8,
            stderr: UTF_8,
        }
    }
}

/// Immutable description of a process launch
#[derive(Debug, Clone)]
pub struct ProcessConfiguration {
    target_path: PathBuf,
    arguments: Vec<String>,
    working_dir: Option<PathBuf>,
    environment: BTreeMap<String, String>,
    credentials: Option<Credentials>,
    shell_execute: bool,
    create_no_window: bool,
    encodings: StreamEncodings,
    input: Option<String>,
    resource_policy: ResourcePolicy,
    redirection: StreamRedirection,
    validation: ResultValidation,
    wait_policy: WaitPolicy,
    kill_tree: bool,
    pipe_drain: Duration,
}

impl ProcessConfiguration {
    /// Start describing a launch of `target_path`
    pub fn builder(target_path: impl Into<PathBuf>) -> ProcessConfigurationBuilder {
        ProcessConfigurationBuilder::new(target_path)
    }

    /// Builder seeded with this configuration
    pub fn to_builder(&self) -> ProcessConfigurationBuilder {
        ProcessConfigurationBuilder {
            target_path: self.target_path.clone(),
            arguments: self.arguments.clone(),
            working_dir: self.working_dir.clone(),
            environment: self
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
            credentials: self.credentials.clone(),
            shell_execute: self.shell_execute,
            create_no_window: self.create_no_window,
            encodings: self.encodings,
            input: self.input.clone(),
            resource_policy: self.resource_policy.clone(),
            redirection: self.redirection,
            validation: self.validation,
            wait_policy: self.wait_policy.clone(),
            kill_tree: self.kill_tree,
            pipe_drain: self.pipe_drain,
        }
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Variables applied on top of the inherited environment
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn shell_execute(&self) -> bool {
        self.shell_execute
    }

    pub fn create_no_window(&self) -> bool {
        self.create_no_window
    }

    pub fn encodings(&self) -> StreamEncodings {
        self.encodings
    }

    /// Text written to stdin, encoded with the stdin encoding
    pub fn input(&self) -> Option<&str> {
        self.input.as_deref()
    }

    pub fn resource_policy(&self) -> &ResourcePolicy {
        &self.resource_policy
    }

    pub fn redirection(&self) -> StreamRedirection {
        self.redirection
    }

    pub fn validation(&self) -> ResultValidation {
        self.validation
    }

    pub fn wait_policy(&self) -> &WaitPolicy {
        &self.wait_policy
    }

    pub fn kill_tree(&self) -> bool {
        self.kill_tree
    }

    pub fn pipe_drain(&self) -> Duration {
        self.pipe_drain
    }

    /// Display name used in logs and errors
    pub fn display_name(&self) -> String {
        self.target_path.display().to_string()
    }
}

/// Chained builder for [`ProcessConfiguration`]
#[derive(Debug, Clone)]
pub struct ProcessConfigurationBuilder {
    target_path: PathBuf,
    arguments: Vec<String>,
    working_dir: Option<PathBuf>,
    environment: BTreeMap<String, Option<String>>,
    credentials: Option<Credentials>,
    shell_execute: bool,
    create_no_window: bool,
    encodings: StreamEncodings,
    input: Option<String>,
    resource_policy: ResourcePolicy,
    redirection: StreamRedirection,
    validation: ResultValidation,
    wait_policy: WaitPolicy,
    kill_tree: bool,
    pipe_drain: Duration,
}

impl ProcessConfigurationBuilder {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            arguments: Vec::new(),
            working_dir: None,
            environment: BTreeMap::new(),
            credentials: None,
            shell_execute: false,
            create_no_window: false,
            encodings: StreamEncodings::default(),
            input: None,
            resource_policy: ResourcePolicy::default(),
            redirection: StreamRedirection::default(),
            validation: ResultValidation::default(),
            wait_policy: WaitPolicy::default(),
            kill_tree: true,
            pipe_drain: DEFAULT_PIPE_DRAIN,
        }
    }

    /// Replace the target program
    pub fn target_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_path = path.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), Some(value.into()));
        self
    }

    /// Add environment variables; entries whose value is `None` are ignored
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.map(Into::into))));
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Launch through the platform shell instead of executing directly
    pub fn shell_execute(mut self, enabled: bool) -> Self {
        self.shell_execute = enabled;
        self
    }

    /// Suppress console window creation (Windows only)
    pub fn create_no_window(mut self, enabled: bool) -> Self {
        self.create_no_window = enabled;
        self
    }

    pub fn stdin_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encodings.stdin = encoding;
        self
    }

    pub fn stdout_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encodings.stdout = encoding;
        self
    }

    pub fn stderr_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encodings.stderr = encoding;
        self
    }

    /// Text to write to the child's stdin
    pub fn input(mut self, text: impl Into<String>) -> Self {
        self.input = Some(text.into());
        self
    }

    pub fn resource_policy(mut self, policy: ResourcePolicy) -> Self {
        self.resource_policy = policy;
        self
    }

    pub fn redirect_stdin(mut self, enabled: bool) -> Self {
        self.redirection.stdin = enabled;
        self
    }

    pub fn redirect_stdout(mut self, enabled: bool) -> Self {
        self.redirection.stdout = enabled;
        self
    }

    pub fn redirect_stderr(mut self, enabled: bool) -> Self {
        self.redirection.stderr = enabled;
        self
    }

    pub fn validation(mut self, validation: ResultValidation) -> Self {
        self.validation = validation;
        self
    }

    /// Replace the whole wait policy
    pub fn wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.wait_policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.wait_policy.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    pub fn cancellation_mode(mut self, mode: CancellationMode) -> Self {
        self.wait_policy.mode = mode;
        self
    }

    pub fn exception_policy(mut self, policy: ExceptionPolicy) -> Self {
        self.wait_policy.exceptions = policy;
        self
    }

    /// How long a gracefully signalled process gets before escalation
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.wait_policy.grace = grace;
        self
    }

    pub fn escalate_after_grace(mut self, escalate: bool) -> Self {
        self.wait_policy.escalate = escalate;
        self
    }

    /// Signal the whole process tree instead of the direct child
    pub fn kill_tree(mut self, enabled: bool) -> Self {
        self.kill_tree = enabled;
        self
    }

    pub fn pipe_drain(mut self, window: Duration) -> Self {
        self.pipe_drain = window;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<ProcessConfiguration> {
        if self.target_path.as_os_str().is_empty()
            || self.target_path.to_string_lossy().trim().is_empty()
        {
            return Err(ProcessError::InvalidArgument(
                "target path must not be empty".to_string(),
            ));
        }

        if self.shell_execute && self.redirection.any() {
            return Err(ProcessError::InvalidOperation(
                "shell execution cannot be combined with stream redirection".to_string(),
            ));
        }

        if let Some(credentials) = &self.credentials {
            if credentials.user.trim().is_empty() {
                return Err(ProcessError::InvalidArgument(
                    "credential user name must not be empty".to_string(),
                ));
            }
            if !cfg!(unix) {
                return Err(ProcessError::PlatformNotSupported(
                    "running as another user".to_string(),
                ));
            }
            if credentials.password.is_some() || credentials.domain.is_some() {
                return Err(ProcessError::PlatformNotSupported(
                    "password or domain credentials".to_string(),
                ));
            }
        }

        self.resource_policy.validate()?;

        Ok(ProcessConfiguration {
            target_path: self.target_path,
            arguments: self.arguments,
            working_dir: self.working_dir,
            environment: self
                .environment
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect(),
            credentials: self.credentials,
            shell_execute: self.shell_execute,
            create_no_window: self.create_no_window,
            encodings: self.encodings,
            input: self.input,
            resource_policy: self.resource_policy,
            redirection: self.redirection,
            validation: self.validation,
            wait_policy: self.wait_policy,
            kill_tree: self.kill_tree,
            pipe_drain: self.pipe_drain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_target_rejected() {
        let err = ProcessConfiguration::builder("").build().unwrap_err();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));

        let err = ProcessConfiguration::builder("   ").build().unwrap_err();
        assert!(matches!(err, ProcessError::InvalidArgument(_)));
    }

    #[test]
    fn test_none_env_values_ignored() {
        let config = ProcessConfiguration::builder("env")
            .env("A", "1")
            .envs([("B", None::<&str>), ("C", Some("3"))])
            .build()
            .unwrap();

        let env = config.environment();
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert!(!env.contains_key("B"));
        assert_eq!(env.get("C").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_shell_execute_requires_no_redirection() {
        let err = ProcessConfiguration::builder("ls")
            .shell_execute(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidOperation(_)));

        let config = ProcessConfiguration::builder("ls")
            .shell_execute(true)
            .redirect_stdin(false)
            .redirect_stdout(false)
            .redirect_stderr(false)
            .build()
            .unwrap();
        assert!(config.shell_execute());
    }

    #[test]
    fn test_password_credentials_not_supported() {
        let err = ProcessConfiguration::builder("id")
            .credentials(Credentials::user("nobody").with_password("secret"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessError::PlatformNotSupported(_)));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::user("svc").with_password("hunter2");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_builder_roundtrip_preserves_fields() {
        let config = ProcessConfiguration::builder("echo")
            .args(["a", "b"])
            .timeout_ms(250)
            .cancellation_mode(CancellationMode::Graceful)
            .validation(ResultValidation::ExitCodeZero)
            .build()
            .unwrap();

        let copy = config.to_builder().arg("c").build().unwrap();
        assert_eq!(copy.arguments(), ["a", "b", "c"]);
        assert_eq!(copy.wait_policy().timeout, Some(Duration::from_millis(250)));
        assert_eq!(copy.wait_policy().mode, CancellationMode::Graceful);
        assert_eq!(copy.validation(), ResultValidation::ExitCodeZero);
    }
}
