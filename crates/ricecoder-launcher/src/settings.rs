//! Launcher settings loaded from TOML and the environment

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ProcessConfigurationBuilder, DEFAULT_PIPE_DRAIN},
    error::{ProcessError, Result},
    resolver::DEFAULT_CACHE_CAPACITY,
    wait::{CancellationMode, ExceptionPolicy, DEFAULT_GRACE_PERIOD},
};

/// Environment variable prefix, e.g. `RICECODER_LAUNCHER_DEFAULT_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "RICECODER_LAUNCHER";

/// Defaults applied to every configuration a launcher creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    pub default_timeout_ms: Option<u64>,
    pub cancellation_mode: CancellationMode,
    pub exception_policy: ExceptionPolicy,
    pub grace_period_ms: u64,
    pub escalate_after_grace: bool,
    pub pipe_drain_ms: u64,
    pub path_cache_capacity: usize,
    pub kill_tree: bool,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            cancellation_mode: CancellationMode::default(),
            exception_policy: ExceptionPolicy::default(),
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
            escalate_after_grace: true,
            pipe_drain_ms: DEFAULT_PIPE_DRAIN.as_millis() as u64,
            path_cache_capacity: DEFAULT_CACHE_CAPACITY,
            kill_tree: true,
        }
    }
}

impl LauncherSettings {
    /// Load from an optional TOML file, then `RICECODER_LAUNCHER_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ProcessError::Settings(format!(
                    "settings file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(Environment::with_prefix(prefix).try_parsing(true));

        let settings: LauncherSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == Some(0) {
            return Err(ProcessError::Settings(
                "default_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.path_cache_capacity == 0 {
            return Err(ProcessError::Settings(
                "path_cache_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Seed a configuration builder with these defaults
    pub fn apply(&self, builder: ProcessConfigurationBuilder) -> ProcessConfigurationBuilder {
        let builder = builder
            .cancellation_mode(self.cancellation_mode)
            .exception_policy(self.exception_policy)
            .grace_period(Duration::from_millis(self.grace_period_ms))
            .escalate_after_grace(self.escalate_after_grace)
            .pipe_drain(Duration::from_millis(self.pipe_drain_ms))
            .kill_tree(self.kill_tree);
        match self.default_timeout_ms {
            Some(ms) => builder.timeout_ms(ms),
            None => builder,
        }
    }
}
