//! Process launcher - lifecycle orchestration

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{ProcessConfiguration, ProcessConfigurationBuilder},
    error::{ProcessError, Result},
    pipe,
    resolver::PathResolver,
    result::{BufferedProcessResult, PipedProcessResult, ProcessResult},
    settings::LauncherSettings,
    shell::ShellInvocation,
    wait::wait_for_exit,
    wrapper::ProcessWrapper,
};

/// Boxed caller-supplied input stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed caller-supplied output stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Caller streams connected to a child's standard streams
#[derive(Default)]
pub struct PipeTargets {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

impl PipeTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    pub fn stdout(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    pub fn stderr(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }
}

/// Single launcher interface with buffered, piped and streaming variants
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Run to completion, discarding redirected output
    async fn run(
        &self,
        config: &ProcessConfiguration,
        cancel: CancellationToken,
    ) -> Result<ProcessResult>;

    /// Run to completion, capturing stdout/stderr as text
    async fn run_buffered(
        &self,
        config: &ProcessConfiguration,
        cancel: CancellationToken,
    ) -> Result<BufferedProcessResult>;

    /// Run to completion, copying between the child and caller streams
    async fn run_piped(
        &self,
        config: &ProcessConfiguration,
        targets: PipeTargets,
        cancel: CancellationToken,
    ) -> Result<PipedProcessResult<Option<BoxedWriter>, Option<BoxedWriter>>>;

    /// Start and hand back live output streams
    async fn spawn_streaming(
        &self,
        config: &ProcessConfiguration,
        cancel: CancellationToken,
    ) -> Result<StreamingProcess>;
}

/// Default [`ProcessLauncher`] over `tokio::process`
#[derive(Clone)]
pub struct Launcher {
    resolver: Arc<PathResolver>,
    settings: LauncherSettings,
}

impl Launcher {
    /// Launcher with default settings and its own PATH cache
    pub fn new() -> Self {
        Self::with_settings(LauncherSettings::default())
    }

    pub fn with_settings(settings: LauncherSettings) -> Self {
        let resolver = Arc::new(PathResolver::new(settings.path_cache_capacity));
        Self { resolver, settings }
    }

    /// Share an existing resolver (and its cache) between launchers
    pub fn with_resolver(settings: LauncherSettings, resolver: Arc<PathResolver>) -> Self {
        Self { resolver, settings }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &Arc<PathResolver> {
        &self.resolver
    }

    /// Configuration builder seeded with this launcher's settings
    ///
    /// # Examples
    /// ```no_run
    /// use ricecoder_launcher::{Launcher, ProcessLauncher};
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let launcher = Launcher::new();
    /// let config = launcher.configure("echo").arg("hello").build()?;
    /// let result = launcher.run_buffered(&config, CancellationToken::new()).await?;
    /// assert_eq!(result.stdout, "hello\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn configure(&self, program: impl Into<PathBuf>) -> ProcessConfigurationBuilder {
        self.settings.apply(ProcessConfiguration::builder(program))
    }

    /// Configuration builder for a shell script, seeded with settings
    pub fn configure_shell(&self, shell: &ShellInvocation) -> ProcessConfigurationBuilder {
        shell.apply(self.configure(shell.program()))
    }

    fn prepare(&self, config: &ProcessConfiguration) -> Result<ProcessWrapper> {
        let program = if config.shell_execute() {
            config.target_path().to_path_buf()
        } else {
            self.resolver
                .resolve(config.target_path(), config.working_dir())?
        };
        Ok(ProcessWrapper::with_program(config.clone(), program))
    }

    fn input_source(config: &ProcessConfiguration) -> Option<BoxedReader> {
        config.input().map(|text| {
            let bytes = pipe::encode_text(config.encodings().stdin, text);
            Box::new(Cursor::new(bytes)) as BoxedReader
        })
    }

    /// Launch, pipe and wait; the engine behind every run variant
    ///
    /// # Arguments
    /// * `config` - What to launch
    /// * `stdin` - Source for the child's stdin (falls back to configured input)
    /// * `stdout`/`stderr` - Sinks for the child's output
    /// * `cancel` - Caller cancellation, shared by the wait and all pipes
    pub async fn execute<O, E>(
        &self,
        config: &ProcessConfiguration,
        stdin: Option<BoxedReader>,
        stdout: O,
        stderr: E,
        cancel: CancellationToken,
    ) -> Result<PipedProcessResult<O, E>>
    where
        O: AsyncWrite + Send + Unpin,
        E: AsyncWrite + Send + Unpin,
    {
        let mut wrapper = self.prepare(config)?;
        let pid = wrapper.start()?;

        let source = stdin.or_else(|| Self::input_source(config));
        let wait_cancel = cancel.child_token();
        let pipe_cancel = cancel.child_token();

        let stdin_task = pipe::feed_stdin(source, wrapper.take_stdin(), pipe_cancel.clone());
        let stdout_task = pipe::drain(wrapper.take_stdout(), stdout, pipe_cancel.clone(), "stdout");
        let stderr_task = pipe::drain(wrapper.take_stderr(), stderr, pipe_cancel.clone(), "stderr");

        let copy = async { tokio::try_join!(stdin_task, stdout_task, stderr_task) };
        tokio::pin!(copy);

        let mut copied = None;
        let outcome = {
            let wait = wait_for_exit(&mut wrapper, config.wait_policy(), &wait_cancel);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    res = &mut copy, if copied.is_none() => {
                        if let Err(e) = &res {
                            warn!(pid, error = %e, "Pipe failed, cancelling process");
                            wait_cancel.cancel();
                        }
                        copied = Some(res);
                    }
                    outcome = &mut wait => break outcome,
                }
            }
        };

        let termination = match outcome {
            Ok(termination) => termination,
            Err(e) => {
                wrapper.ensure_exited().await;
                return Err(match copied {
                    // The pipe failure is what cancelled the wait.
                    Some(Err(pipe_err)) => ProcessError::Io(pipe_err),
                    Some(Ok(_)) => e,
                    None => {
                        pipe_cancel.cancel();
                        let _ = copy.await;
                        e
                    }
                });
            }
        };

        let copied = match copied {
            Some(res) => res,
            None => match tokio::time::timeout(config.pipe_drain(), &mut copy).await {
                Ok(res) => res,
                Err(_) => {
                    debug!(pid, "Pipes still open after exit, cancelling");
                    pipe_cancel.cancel();
                    copy.await
                }
            },
        };

        let (_, (stdout, stdout_bytes), (stderr, stderr_bytes)) = match copied {
            Ok(streams) => streams,
            Err(e) => {
                wrapper.ensure_exited().await;
                return Err(ProcessError::Io(e));
            }
        };

        let result = ProcessResult::from_wrapper(&wrapper, termination)?;
        info!(
            pid,
            exit_code = result.exit_code,
            termination = ?result.termination,
            elapsed_ms = result.elapsed().as_millis() as u64,
            "Process finished"
        );
        let result = result.validate(config.validation())?;

        Ok(PipedProcessResult {
            result,
            stdout,
            stderr,
            stdout_bytes,
            stderr_bytes,
        })
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for Launcher {
    async fn run(
        &self,
        config: &ProcessConfiguration,
        cancel: CancellationToken,
    ) -> Result<ProcessResult> {
        let piped = self
            .execute(config, None, tokio::io::sink(), tokio::io::sink(), cancel)
            .await?;
        Ok(piped.into_result())
    }

    async fn run_buffered(
        &self,
        config: &ProcessConfiguration,
        cancel: CancellationToken,
    ) -> Result<BufferedProcessResult> {
        let piped = self
            .execute(config, None, Vec::new(), Vec::new(), cancel)
            .await?;
        let encodings = config.encodings();
        Ok(BufferedProcessResult {
            stdout: pipe::decode_text(encodings.stdout, &piped.stdout),
            stderr: pipe::decode_text(encodings.stderr, &piped.stderr),
            result: piped.result,
        })
    }

    async fn run_piped(
        &self,
        config: &ProcessConfiguration,
        targets: PipeTargets,
        cancel: CancellationToken,
    ) -> Result<PipedProcessResult<Option<BoxedWriter>, Option<BoxedWriter>>> {
        let PipeTargets {
            stdin,
            stdout,
            stderr,
        } = targets;
        let stdout_sink = OptionalSink(stdout);
        let stderr_sink = OptionalSink(stderr);
        let piped = self
            .execute(config, stdin, stdout_sink, stderr_sink, cancel)
            .await?;
        Ok(PipedProcessResult {
            result: piped.result,
            stdout: piped.stdout.0,
            stderr: piped.stderr.0,
            stdout_bytes: piped.stdout_bytes,
            stderr_bytes: piped.stderr_bytes,
        })
    }

    async fn spawn_streaming(
        &self,
        config: &ProcessConfiguration,
        cancel: CancellationToken,
    ) -> Result<StreamingProcess> {
        let mut wrapper = self.prepare(config)?;
        let pid = wrapper.start()?;

        let mut stdin = wrapper.take_stdin();
        if let Some(source) = Self::input_source(config) {
            let child_stdin = stdin.take();
            let feed_cancel = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = pipe::feed_stdin(Some(source), child_stdin, feed_cancel).await {
                    warn!(error = %e, "Failed to write process input");
                }
            });
        }

        let stdout = wrapper.take_stdout();
        let stderr = wrapper.take_stderr();
        // The timeout runs from start, whether or not the caller is waiting yet.
        let exit = tokio::spawn(supervise(wrapper, cancel));

        Ok(StreamingProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit: Some(exit),
        })
    }
}

/// Exit wait for a streaming process, run on its own task
async fn supervise(
    mut wrapper: ProcessWrapper,
    cancel: CancellationToken,
) -> Result<ProcessResult> {
    let policy = wrapper.configuration().wait_policy().clone();
    let termination = match wait_for_exit(&mut wrapper, &policy, &cancel).await {
        Ok(termination) => termination,
        Err(e) => {
            wrapper.ensure_exited().await;
            return Err(e);
        }
    };

    let validation = wrapper.configuration().validation();
    ProcessResult::from_wrapper(&wrapper, termination)?.validate(validation)
}

/// Sink that discards output when the caller supplied none
struct OptionalSink(Option<BoxedWriter>);

impl AsyncWrite for OptionalSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.0.as_mut() {
            Some(sink) => std::pin::Pin::new(sink).poll_write(cx, buf),
            None => std::task::Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.0.as_mut() {
            Some(sink) => std::pin::Pin::new(sink).poll_flush(cx),
            None => std::task::Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.0.as_mut() {
            Some(sink) => std::pin::Pin::new(sink).poll_shutdown(cx),
            None => std::task::Poll::Ready(Ok(())),
        }
    }
}

/// A started process exposing its output as live streams
///
/// The exit wait runs in the background from the moment the process starts;
/// dropping this value without waiting kills the process.
pub struct StreamingProcess {
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: Option<JoinHandle<Result<ProcessResult>>>,
}

impl StreamingProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Stdin, unless configured input is already being written to it
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Stdout as a line stream
    pub fn stdout_lines(&mut self) -> Option<Lines<BufReader<ChildStdout>>> {
        self.stdout.take().map(|out| BufReader::new(out).lines())
    }

    /// Stderr as a line stream
    pub fn stderr_lines(&mut self) -> Option<Lines<BufReader<ChildStderr>>> {
        self.stderr.take().map(|err| BufReader::new(err).lines())
    }

    /// Join the exit wait and return the result
    ///
    /// Streams not taken by the caller are dropped first so the child cannot
    /// block on a full pipe.
    pub async fn wait(mut self) -> Result<ProcessResult> {
        drop(self.stdin.take());
        drop(self.stdout.take());
        drop(self.stderr.take());

        let Some(exit) = self.exit.take() else {
            return Err(ProcessError::InvalidOperation(
                "process has already been waited on".to_string(),
            ));
        };
        exit.await.map_err(|e| ProcessError::Io(e.into()))?
    }
}

impl Drop for StreamingProcess {
    fn drop(&mut self) {
        if let Some(exit) = self.exit.take() {
            // Dropping the wrapper inside the task kills the child.
            debug!(pid = self.pid, "Streaming process dropped before wait");
            exit.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_echo() {
        let launcher = Launcher::new();
        let config = launcher.configure("echo").arg("hello").build().unwrap();

        let result = launcher
            .run_buffered(&config, CancellationToken::new())
            .await
            .unwrap();
        assert!(result.result.pid > 0);
        assert_eq!(result.stdout, "hello\n");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_program() {
        let launcher = Launcher::new();
        let config = launcher
            .configure("ricecoder-launcher-missing-program")
            .build()
            .unwrap();
        let err = launcher
            .run(&config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_optional_sink_discards() {
        use tokio::io::AsyncWriteExt;

        let mut sink = OptionalSink(None);
        sink.write_all(b"ignored").await.unwrap();
        sink.flush().await.unwrap();
    }
}
