// Logging setup for rclaunch

use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "ricecoder_launcher=debug,ricecoder_launcher_cli=debug"
    } else {
        "warn"
    }
}

/// Initialize tracing on stderr so child output on stdout stays clean
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    // A subscriber may already be installed when embedded in tests.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}
