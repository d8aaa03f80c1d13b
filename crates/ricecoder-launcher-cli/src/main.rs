// rclaunch entry point

use clap::Parser;
use ricecoder_launcher::CancellationToken;
use ricecoder_launcher_cli::{logging, run, Cli, EXIT_LAUNCH_FAILED};
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling child process");
            ctrl_c.cancel();
        }
    });

    let code = match run(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rclaunch: {:#}", e);
            EXIT_LAUNCH_FAILED
        }
    };

    debug!(code, "rclaunch exiting");
    std::process::exit(code);
}
