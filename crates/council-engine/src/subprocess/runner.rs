//! Runs one agent command as a child process (or through an HTTP provider).

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use council_core::Limits;
use council_core::command::tokenize_command;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cancel::{ActiveChildGuard, CancelState, GroupSignal, signal_group};
use super::capture::OutputCapture;
use super::command::{PreparedCommand, prepare_argv};
use super::provider::{HttpProvider, ProviderRegistry};
use super::{ExecRequest, LineCallback, StepExecutor};
use crate::error::ExecError;

/// Grace period between SIGTERM and SIGKILL.
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);
/// Only the tail of stderr is kept for error reports.
const MAX_STDERR_BYTES: usize = 64 * 1024;
/// Longest piece of a stdout line held at once. Longer lines are forwarded
/// in several pieces, so at most `LINE_CHANNEL_CAPACITY` pieces of this size
/// are in flight regardless of how the child formats its output.
pub(crate) const MAX_LINE_PIECE_BYTES: usize = 64 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 64;

/// Seam between the runner and the OS.
pub trait Spawner: Send + Sync {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child>;
}

/// Spawns through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, command: &mut Command) -> std::io::Result<Child> {
        command.spawn()
    }
}

/// Executes step commands one at a time with bounded input and output,
/// a post-EOF timeout and cooperative cancellation.
///
/// A runner is reusable: a cancellation request is consumed by the
/// [`ExecError::Aborted`] it produces. A request made while nothing runs
/// aborts the next [`execute`](Self::execute) before anything is spawned.
pub struct ProcessRunner {
    limits: Limits,
    spawner: Arc<dyn Spawner>,
    providers: ProviderRegistry,
    cancel: CancelState,
    terminate_grace: Duration,
}

impl std::fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("limits", &self.limits)
            .field("providers", &self.providers)
            .field("terminate_grace", &self.terminate_grace)
            .finish_non_exhaustive()
    }
}

enum WaitOutcome {
    Exited(std::io::Result<ExitStatus>, String),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    /// Runner with the default spawner and the default provider registry.
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            spawner: Arc::new(TokioSpawner),
            providers: ProviderRegistry::with_defaults(),
            cancel: CancelState::new(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    #[must_use]
    pub const fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Stop the current execution. Safe from any thread, idempotent, and a
    /// no-op for the process table when nothing is running.
    pub fn request_cancel(&self) {
        self.cancel.request();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Drop a pending cancellation request.
    pub fn clear_cancel(&self) {
        self.cancel.reset();
    }

    /// Run `request.command` with `request.input` and return its output.
    pub async fn execute(
        &self,
        request: ExecRequest<'_>,
        on_line: LineCallback<'_>,
    ) -> Result<String, ExecError> {
        let result = self.execute_inner(request, on_line).await;
        if matches!(result, Err(ExecError::Aborted)) {
            self.cancel.reset();
        }
        result
    }

    async fn execute_inner(
        &self,
        request: ExecRequest<'_>,
        on_line: LineCallback<'_>,
    ) -> Result<String, ExecError> {
        if self.cancel.is_requested() {
            info!(command = request.command, "Cancellation pending, not starting step");
            return Err(ExecError::Aborted);
        }

        if request.timeout.is_zero() {
            return Err(ExecError::InvalidConfiguration(
                "timeout must be greater than zero".into(),
            ));
        }
        let max_input = effective_cap(
            "max_input_chars",
            request.max_input_chars,
            self.limits.max_input_chars,
        )?;
        let max_output = effective_cap(
            "max_output_chars",
            request.max_output_chars,
            self.limits.max_output_chars,
        )?;

        let input_chars = request.input.chars().count();
        if input_chars > max_input {
            warn!(input_chars, limit = max_input, "Step input above limit, not spawning");
            return Err(ExecError::InputTooLarge {
                actual: input_chars,
                limit: max_input,
            });
        }

        let argv = tokenize_command(request.command)?;
        let Some(binary) = argv.first() else {
            return Err(ExecError::InvalidConfiguration("command is empty".into()));
        };

        if let Some(provider) = self.providers.get(binary) {
            return self
                .execute_provider(provider.as_ref(), &argv, request, max_output, on_line)
                .await;
        }

        let prepared = prepare_argv(argv, request.input);
        self.execute_child(prepared, request, max_output, on_line)
            .await
    }

    async fn execute_provider(
        &self,
        provider: &dyn HttpProvider,
        argv: &[String],
        request: ExecRequest<'_>,
        max_output: usize,
        on_line: LineCallback<'_>,
    ) -> Result<String, ExecError> {
        info!(provider = %argv[0], "Calling in-process provider");
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(ExecError::Aborted),
            result = tokio::time::timeout(
                request.timeout,
                provider.complete(argv, request.input),
            ) => {
                match result {
                    Ok(response) => response?,
                    Err(_) => {
                        warn!(
                            provider = %argv[0],
                            timeout_secs = request.timeout.as_secs(),
                            "Provider request timed out"
                        );
                        return Err(ExecError::Timeout {
                            command: request.command.to_string(),
                            timeout: request.timeout,
                        });
                    }
                }
            }
        };

        let mut capture = OutputCapture::new(max_output);
        for line in response.split_inclusive('\n') {
            capture.push(line)?;
            on_line(line.trim_end_matches(['\n', '\r']));
            if self.cancel.is_requested() {
                return Err(ExecError::Aborted);
            }
        }
        debug!(
            chars = capture.total_chars(),
            truncated = capture.is_truncated(),
            "Provider response captured"
        );
        Ok(capture.finish())
    }

    #[allow(clippy::too_many_lines)]
    async fn execute_child(
        &self,
        prepared: PreparedCommand,
        request: ExecRequest<'_>,
        max_output: usize,
        on_line: LineCallback<'_>,
    ) -> Result<String, ExecError> {
        if self.cancel.is_requested() {
            return Err(ExecError::Aborted);
        }

        let PreparedCommand { argv, stdin } = prepared;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            binary = %argv[0],
            args = argv.len() - 1,
            via_stdin = stdin.is_some(),
            timeout_secs = request.timeout.as_secs(),
            "Spawning agent subprocess"
        );
        let mut child = self.spawner.spawn(&mut cmd).map_err(|e| {
            ExecError::SystemError(format!("failed to spawn '{}': {e}", argv[0]))
        })?;
        let pgid = child.id();
        let _active = ActiveChildGuard::new(&self.cancel, pgid);

        if self.cancel.is_requested() {
            self.terminate(&mut child, pgid).await;
            return Err(ExecError::Aborted);
        }

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "Child closed stdin early");
                }
                // Dropping the pipe delivers EOF.
                drop(pipe);
            });
        }

        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s, MAX_STDERR_BYTES)));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::SystemError("failed to capture child stdout".into()))?;

        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        let reader = tokio::spawn(forward_lines(stdout, line_tx, MAX_LINE_PIECE_BYTES));

        let mut capture = OutputCapture::new(max_output);
        let streamed: Result<(), ExecError> = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Err(ExecError::Aborted),
                next = line_rx.recv() => match next {
                    Some(line) => {
                        if let Err(e) = capture.push(&line) {
                            break Err(e.into());
                        }
                        on_line(line.trim_end_matches(['\n', '\r']));
                        if self.cancel.is_requested() {
                            break Err(ExecError::Aborted);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        if let Err(err) = streamed {
            info!(binary = %argv[0], "Stopping agent subprocess");
            reader.abort();
            if let Some(task) = &stderr_task {
                task.abort();
            }
            self.terminate(&mut child, pgid).await;
            return Err(err);
        }

        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => WaitOutcome::Cancelled,
            waited = tokio::time::timeout(request.timeout, async {
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                (child.wait().await, stderr)
            }) => match waited {
                Ok((status, stderr)) => WaitOutcome::Exited(status, stderr),
                Err(_) => WaitOutcome::TimedOut,
            },
        };

        match outcome {
            WaitOutcome::Cancelled => {
                self.terminate(&mut child, pgid).await;
                Err(ExecError::Aborted)
            }
            WaitOutcome::TimedOut => {
                warn!(
                    binary = %argv[0],
                    timeout_secs = request.timeout.as_secs(),
                    "Agent did not exit in time, terminating"
                );
                self.terminate(&mut child, pgid).await;
                Err(ExecError::Timeout {
                    command: request.command.to_string(),
                    timeout: request.timeout,
                })
            }
            WaitOutcome::Exited(status, stderr) => {
                let status = status?;
                if !status.success() {
                    let code = status.code().unwrap_or(-1);
                    warn!(binary = %argv[0], code, "Agent exited with failure");
                    return Err(ExecError::NonZeroExit {
                        command: request.command.to_string(),
                        code,
                        stderr: stderr.trim().to_string(),
                    });
                }
                debug!(
                    binary = %argv[0],
                    chars = capture.total_chars(),
                    truncated = capture.is_truncated(),
                    "Agent finished"
                );
                Ok(capture.finish())
            }
        }
    }

    /// SIGTERM the process group, then SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child, pgid: Option<u32>) {
        match pgid {
            Some(pgid) => {
                if let Err(e) = signal_group(pgid, GroupSignal::Terminate) {
                    debug!(pgid, error = %e, "SIGTERM to process group failed");
                    child.start_kill().ok();
                }
            }
            None => {
                child.start_kill().ok();
            }
        }

        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Agent subprocess terminated"),
            Ok(Err(e)) => warn!(error = %e, "Error waiting for agent subprocess"),
            Err(_) => {
                warn!("Agent ignored SIGTERM, killing process group");
                if let Some(pgid) = pgid {
                    signal_group(pgid, GroupSignal::Kill).ok();
                }
                child.kill().await.ok();
            }
        }
        // Leftover group members may still hold pipes open.
        if let Some(pgid) = pgid {
            signal_group(pgid, GroupSignal::Kill).ok();
        }
    }
}

impl StepExecutor for ProcessRunner {
    fn execute(
        &self,
        request: ExecRequest<'_>,
        on_line: LineCallback<'_>,
    ) -> impl std::future::Future<Output = Result<String, ExecError>> + Send {
        Self::execute(self, request, on_line)
    }

    fn cancel_requested(&self) -> bool {
        self.is_cancel_requested()
    }

    fn clear_cancel(&self) {
        Self::clear_cancel(self);
    }
}

fn effective_cap(name: &str, step_cap: Option<usize>, default: usize) -> Result<usize, ExecError> {
    let cap = step_cap.unwrap_or(default);
    if cap == 0 {
        return Err(ExecError::InvalidConfiguration(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(cap)
}

/// Send `source` to `tx` line by line, splitting any line longer than
/// `max_piece` bytes at a UTF-8 boundary. Pieces keep their newline.
pub(crate) async fn forward_lines<R: AsyncRead + Unpin>(
    source: R,
    tx: mpsc::Sender<String>,
    max_piece: usize,
) {
    let mut reader = BufReader::new(source);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let available = match reader.fill_buf().await {
            Ok(buf) if buf.is_empty() => break,
            Ok(buf) => buf,
            Err(e) => {
                warn!(error = %e, "Failed to read child stdout");
                break;
            }
        };
        let room = max_piece.saturating_sub(pending.len()).max(1);
        let window = &available[..available.len().min(room)];
        let (consumed, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (window.len(), pending.len() + window.len() >= max_piece),
        };
        pending.extend_from_slice(&window[..consumed]);
        reader.consume(consumed);
        if !complete {
            continue;
        }

        let cut = if pending.ends_with(b"\n") {
            pending.len()
        } else {
            utf8_boundary(&pending)
        };
        let rest = pending.split_off(cut);
        let piece = String::from_utf8_lossy(&pending).into_owned();
        pending = rest;
        if tx.send(piece).await.is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

/// Length of the longest prefix of `bytes` that does not end inside a
/// multi-byte character.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => bytes.len(),
    }
}

/// Read `source` to EOF keeping only the last `max_bytes` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut source: R, max_bytes: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&buf[..n]);
                if kept.len() > max_bytes {
                    let excess = kept.len() - max_bytes;
                    kept.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}
