//! # ricecoder-launcher
//!
//! **Purpose**: Process launching for RiceCoder on top of `tokio::process`
//!
//! Wraps the host's process APIs with an immutable configuration builder,
//! lifecycle tracking, resource policies, stream piping and a timeout-aware
//! exit wait.
//!
//! ## Features
//!
//! - **Configuration**: Validated, immutable [`ProcessConfiguration`] built fluently
//! - **Lifecycle**: [`ProcessWrapper`] records start/exit timestamps, starts at most once
//! - **Resource Policy**: CPU affinity, working-set limit and priority class
//! - **Piping**: Concurrent stdin/stdout/stderr copy loops joined before the result
//! - **Exit Wait**: Timeout and cancellation with graceful or forceful shutdown
//! - **Results**: Plain, buffered (decoded text) and piped results; live streaming
//! - **Shells**: cmd.exe, PowerShell (`-EncodedCommand`) and POSIX `sh -c`
//! - **PATH Cache**: Explicit [`PathResolver`] shared by reference
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use ricecoder_launcher::{
//!     CancellationMode, Launcher, ProcessLauncher, ResultValidation,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let launcher = Launcher::new();
//!
//! let config = launcher
//!     .configure("cargo")
//!     .args(["--version"])
//!     .timeout(Duration::from_secs(30))
//!     .cancellation_mode(CancellationMode::Forceful)
//!     .validation(ResultValidation::ExitCodeZero)
//!     .build()?;
//!
//! let result = launcher.run_buffered(&config, CancellationToken::new()).await?;
//! println!("{}", result.stdout);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod launcher;
pub mod pipe;
pub mod resolver;
pub mod resource;
pub mod result;
pub mod settings;
pub mod shell;
pub mod wait;
pub mod wrapper;

pub use config::{
    Credentials, ProcessConfiguration, ProcessConfigurationBuilder, ResultValidation,
    StreamEncodings, StreamRedirection,
};
pub use error::{ProcessError, Result};
pub use launcher::{
    BoxedReader, BoxedWriter, Launcher, PipeTargets, ProcessLauncher, StreamingProcess,
};
pub use resolver::PathResolver;
pub use resource::{PriorityClass, ResourcePolicy};
pub use result::{BufferedProcessResult, PipedProcessResult, ProcessResult};
pub use settings::LauncherSettings;
pub use shell::{ShellInvocation, ShellKind};
pub use wait::{CancellationMode, ExceptionPolicy, Termination, WaitPolicy};
pub use wrapper::{ProcessState, ProcessWrapper};

pub use encoding_rs;
pub use tokio_util::sync::CancellationToken;
