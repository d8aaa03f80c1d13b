#![cfg(unix)]

use std::io::Write;
use std::time::{Duration, Instant};

use clap::Parser;
use ricecoder_launcher::CancellationToken;
use ricecoder_launcher_cli::{run, Cli, EXIT_CANCELLED, EXIT_LAUNCH_FAILED, EXIT_TIMEOUT};

fn cli(args: &[&str]) -> Cli {
    let mut argv = vec!["rclaunch"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

#[tokio::test]
async fn test_exit_code_is_mirrored() {
    let code = run(cli(&["sh", "-c", "exit 3"]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(code, 3);
}

#[tokio::test]
async fn test_check_reports_nonzero_exit() {
    let code = run(cli(&["--check", "false"]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(code, 1);
}

#[tokio::test]
async fn test_timeout_maps_to_124() {
    let started = Instant::now();
    let code = run(
        cli(&["--timeout-ms", "100", "--mode", "forceful", "sleep", "10"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(code, EXIT_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_suppressed_timeout_reports_signal_exit() {
    let code = run(
        cli(&["--timeout-ms", "100", "--exceptions", "suppress", "sleep", "10"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // Killed by a signal rather than reported as a timeout
    assert!(code > 128);
    assert_ne!(code, EXIT_TIMEOUT);
}

#[tokio::test]
async fn test_cancellation_maps_to_130() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let code = run(cli(&["sleep", "10"]), cancel).await.unwrap();
    assert_eq!(code, EXIT_CANCELLED);
}

#[tokio::test]
async fn test_missing_program_is_launch_failure() {
    let code = run(
        cli(&["definitely-not-a-real-program-rclaunch"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(code, EXIT_LAUNCH_FAILED);
}

#[tokio::test]
async fn test_settings_file_supplies_timeout() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "default_timeout_ms = 100").unwrap();
    writeln!(file, "cancellation_mode = \"forceful\"").unwrap();
    file.flush().unwrap();

    let path = file.path().to_str().unwrap().to_string();
    let code = run(cli(&["--config", &path, "sleep", "10"]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(code, EXIT_TIMEOUT);
}

#[tokio::test]
async fn test_missing_settings_file_is_error() {
    let result = run(
        cli(&["--config", "/nonexistent/rclaunch.toml", "true"]),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_posix_shell_script() {
    let code = run(
        cli(&["--shell", "posix", "test $((2 + 2)) -eq 4"]),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(code, 0);
}
