//! Command execution on the host or in the isolated target.
//!
//! [`SandboxExecutor::stream`] spawns the command in its own process group
//! and returns an [`OutputStream`]: output lines from stdout and stderr as
//! they arrive, followed by exactly one [`ExecChunk::Finished`].  Dropping the
//! stream kills the whole group.  [`SandboxExecutor::run`] drains the stream
//! and returns only the final [`ExecutionResult`].
//!
//! Callers are expected to have passed the command through
//! [`SafetyGuard`](crate::safety::SafetyGuard) first.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use termagent_config::{ExecTarget, IsolationMode, SandboxConfig};

/// Shell exit status for "command not found".
const EXIT_NOT_FOUND: i32 = 127;
const TRUNCATION_MARKER: &str = "…[truncated]";

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    /// The process exited on its own, whatever its exit code.
    Completed,
    TimedOut,
    NotFound,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecStatus,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process produced no exit code.
    pub returncode: i32,
}

impl ExecutionResult {
    fn failed(status: ExecStatus, command: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            command: command.to_string(),
            stdout: String::new(),
            stderr: message.into(),
            returncode: -1,
        }
    }

    /// `--- Command finished with exit code N ---`
    pub fn summary_line(&self) -> String {
        format!("--- Command finished with exit code {} ---", self.returncode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    /// One line of output, without its trailing newline.
    Line { source: OutputSource, text: String },
    Finished(ExecutionResult),
}

/// Lazy, finite output of one command.  Not restartable.
pub struct OutputStream {
    rx: mpsc::Receiver<ExecChunk>,
}

impl Stream for OutputStream {
    type Item = ExecChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ExecChunk>> {
        self.rx.poll_recv(cx)
    }
}

impl OutputStream {
    /// Drain the stream, discarding lines, and return the final result.
    pub async fn finish(mut self) -> ExecutionResult {
        while let Some(chunk) = self.rx.recv().await {
            if let ExecChunk::Finished(result) = chunk {
                return result;
            }
        }
        ExecutionResult::failed(ExecStatus::Error, "", "executor stopped without a result")
    }
}

// ── Output capture ───────────────────────────────────────────────────────────

/// Byte-capped accumulator for one pipe.
struct Capture {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &str) {
        if self.truncated {
            return;
        }
        if self.buf.len() + chunk.len() <= self.limit {
            self.buf.push_str(chunk);
            return;
        }
        let mut end = self.limit.saturating_sub(self.buf.len()).min(chunk.len());
        while end > 0 && !chunk.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.push_str(&chunk[..end]);
        self.buf.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }
}

// ── Executor ─────────────────────────────────────────────────────────────────

pub struct SandboxExecutor {
    config: SandboxConfig,
    workdir: PathBuf,
    http: reqwest::Client,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, workdir: impl Into<PathBuf>) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            workdir: workdir.into(),
            http,
        })
    }


    /// Resolve a per-call timeout in seconds against the configured default.
    /// `0` (either source) means no timeout.
    pub fn resolve_timeout(&self, requested_secs: Option<u64>) -> Option<Duration> {
        match requested_secs.unwrap_or(self.config.default_timeout_secs) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// argv for a locally spawned command.
    fn argv(&self, command: &str, target: ExecTarget) -> Vec<String> {
        let mut argv = match target {
            ExecTarget::Host => Vec::new(),
            ExecTarget::Isolated => self.config.isolation_command.clone(),
        };
        argv.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
        argv
    }

    /// Start `command` and stream its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(
        &self,
        command: &str,
        target: ExecTarget,
        timeout: Option<Duration>,
    ) -> OutputStream {
        let (tx, rx) = mpsc::channel(64);
        let command = command.to_string();
        let max_output = self.config.max_output_bytes;

        if target == ExecTarget::Isolated && self.config.isolation == IsolationMode::Remote {
            let http = self.http.clone();
            let url = format!("{}/execute", self.config.remote_url.trim_end_matches('/'));
            info!(%command, %url, "forwarding command to remote sandbox");
            tokio::spawn(drive_remote(http, url, command, timeout, tx));
        } else {
            let argv = self.argv(&command, target);
            let workdir = self.workdir.clone();
            info!(%command, ?target, "spawning command");
            tokio::spawn(drive_local(argv, workdir, command, timeout, max_output, tx));
        }
        OutputStream { rx }
    }

    /// Run `command` to completion and return its result.
    pub async fn run(
        &self,
        command: &str,
        target: ExecTarget,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        self.stream(command, target, timeout).finish().await
    }
}

// ── Local process driver ─────────────────────────────────────────────────────

async fn drive_local(
    argv: Vec<String>,
    workdir: PathBuf,
    command: String,
    timeout: Option<Duration>,
    max_output: usize,
    tx: mpsc::Sender<ExecChunk>,
) {
    if let Some(result) = run_local(&argv, &workdir, &command, timeout, max_output, &tx).await {
        info!(status = ?result.status, returncode = result.returncode, "command finished");
        let _ = tx.send(ExecChunk::Finished(result)).await;
    }
}

/// `None` means the consumer went away and the process was killed.
async fn run_local(
    argv: &[String],
    workdir: &Path,
    command: &str,
    timeout: Option<Duration>,
    max_output: usize,
    tx: &mpsc::Sender<ExecChunk>,
) -> Option<ExecutionResult> {
    let Some((program, args)) = argv.split_first() else {
        return Some(ExecutionResult::failed(ExecStatus::Error, command, "empty argv"));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(program, "executable not found");
            return Some(ExecutionResult::failed(
                ExecStatus::NotFound,
                command,
                format!("'{program}' is not installed or not on PATH"),
            ));
        }
        Err(err) => {
            return Some(ExecutionResult::failed(
                ExecStatus::Error,
                command,
                format!("failed to spawn '{program}': {err}"),
            ));
        }
    };

    // One reader task per pipe, merged into a single channel so lines are
    // forwarded in arrival order.
    let (line_tx, mut line_rx) = mpsc::channel::<(OutputSource, String)>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, OutputSource::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, OutputSource::Stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut stdout = Capture::new(max_output);
    let mut stderr = Capture::new(max_output);

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let timed_out_result = |stdout: Capture, stderr: Capture| ExecutionResult {
        status: ExecStatus::TimedOut,
        command: command.to_string(),
        stdout: stdout.buf,
        stderr: stderr.buf,
        returncode: -1,
    };

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(command, "output consumer dropped; killing process group");
                kill_group(&mut child).await;
                return None;
            }
            _ = &mut deadline => {
                warn!(command, ?timeout, "command timed out; killing process group");
                kill_group(&mut child).await;
                return Some(timed_out_result(stdout, stderr));
            }
            next = line_rx.recv() => {
                let Some((source, raw)) = next else { break };
                match source {
                    OutputSource::Stdout => stdout.push(&raw),
                    OutputSource::Stderr => stderr.push(&raw),
                }
                let text = raw
                    .strip_suffix('\n')
                    .map(|s| s.strip_suffix('\r').unwrap_or(s))
                    .unwrap_or(&raw)
                    .to_string();
                if tx.send(ExecChunk::Line { source, text }).await.is_err() {
                    kill_group(&mut child).await;
                    return None;
                }
            }
        }
    }

    // Output is closed; the process may still be running.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut deadline => {
            warn!(command, ?timeout, "command timed out after closing output");
            kill_group(&mut child).await;
            return Some(timed_out_result(stdout, stderr));
        }
        _ = tx.closed() => {
            kill_group(&mut child).await;
            return None;
        }
    };

    let result = match status {
        Ok(status) => {
            let returncode = status.code().unwrap_or(-1);
            ExecutionResult {
                status: if returncode == EXIT_NOT_FOUND {
                    ExecStatus::NotFound
                } else {
                    ExecStatus::Completed
                },
                command: command.to_string(),
                stdout: stdout.buf,
                stderr: stderr.buf,
                returncode,
            }
        }
        Err(err) => ExecutionResult {
            status: ExecStatus::Error,
            command: command.to_string(),
            stdout: stdout.buf,
            stderr: format!("{}failed to wait for process: {err}", stderr.buf),
            returncode: -1,
        },
    };
    Some(result)
}

async fn pump_lines<R>(pipe: R, source: OutputSource, tx: mpsc::Sender<(OutputSource, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((source, line)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(?source, %err, "pipe read failed");
                break;
            }
        }
    }
}

/// SIGKILL the child's process group, then reap the child.
async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg has no memory-safety preconditions; the group id is
        // the child's pid because it was spawned with process_group(0).
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, err = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

// ── Remote isolated driver ───────────────────────────────────────────────────

async fn drive_remote(
    http: reqwest::Client,
    url: String,
    command: String,
    timeout: Option<Duration>,
    tx: mpsc::Sender<ExecChunk>,
) {
    let result = tokio::select! {
        result = call_remote(&http, &url, &command, timeout) => result,
        _ = tx.closed() => return,
    };

    for (source, text) in [
        (OutputSource::Stdout, &result.stdout),
        (OutputSource::Stderr, &result.stderr),
    ] {
        for line in text.lines() {
            let chunk = ExecChunk::Line {
                source,
                text: line.to_string(),
            };
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    }
    let _ = tx.send(ExecChunk::Finished(result)).await;
}

async fn call_remote(
    http: &reqwest::Client,
    url: &str,
    command: &str,
    timeout: Option<Duration>,
) -> ExecutionResult {
    let mut request = http.post(url).json(&json!({ "command": command }));
    if let Some(limit) = timeout {
        request = request.timeout(limit);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            return ExecutionResult::failed(ExecStatus::TimedOut, command, err.to_string());
        }
        Err(err) => {
            return ExecutionResult::failed(
                ExecStatus::Error,
                command,
                format!("connection to sandbox API at {url} failed: {err}"),
            );
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return ExecutionResult::failed(
            ExecStatus::Error,
            command,
            format!("sandbox API returned {status}: {body}"),
        );
    }
    match response.json::<ExecutionResult>().await {
        Ok(result) => result,
        Err(err) => ExecutionResult::failed(
            ExecStatus::Error,
            command,
            format!("invalid sandbox API response: {err}"),
        ),
    }
}
