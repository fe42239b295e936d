//! Single-flight assistant subprocess runner.
//!
//! [`ProcessManager::spawn`] starts `claude --resume <id> <message>` and hands
//! back a [`ProcessHandle`] whose deltas are the newly generated suffix of the
//! assistant's answer. At most one subprocess is alive per manager: spawning
//! terminates the previous one and waits for it to exit before starting the
//! next.

use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

use crate::stream::StreamDecoder;

/// Variables identifying the invoking assistant session; a resumed child must
/// not inherit them.
pub const STRIPPED_ENV_VARS: &[&str] = &["CLAUDE_SESSION_ID", "CLAUDECODE", "CLAUDE_CODE_ENTRYPOINT"];

const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn resume_args(&self, session_id: &str, message: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend(
            [
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--resume",
                session_id,
                "--dangerously-skip-permissions",
                message,
            ]
            .map(str::to_string),
        );
        args
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub killed: bool,
    /// Captured stderr when the process failed or produced no text.
    pub error_text: Option<String>,
}

impl ProcessExit {
    fn lost() -> Self {
        Self {
            code: None,
            killed: true,
            error_text: None,
        }
    }
}

/// One running (or finished) invocation.
#[derive(Debug)]
pub struct ProcessHandle {
    id: u64,
    deltas: mpsc::UnboundedReceiver<String>,
    exit: watch::Receiver<Option<ProcessExit>>,
    cancel: CancellationToken,
}

impl ProcessHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next text delta, or `None` once the process closed its output or was
    /// killed.
    pub async fn next_delta(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            delta = self.deltas.recv() => delta,
        }
    }

    /// Terminate the subprocess. Safe to call repeatedly.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the subprocess has exited.
    pub async fn wait(&self) -> ProcessExit {
        wait_exit(self.exit.clone()).await
    }
}

async fn wait_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    loop {
        if let Some(done) = exit.borrow_and_update().clone() {
            return done;
        }
        if exit.changed().await.is_err() {
            return exit.borrow().clone().unwrap_or_else(ProcessExit::lost);
        }
    }
}

#[derive(Debug)]
struct ActiveProcess {
    id: u64,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<ProcessExit>>,
}

#[derive(Debug, Clone)]
pub struct ProcessManager {
    command: ProcessCommand,
    slot: Arc<Mutex<Option<ActiveProcess>>>,
    next_id: Arc<AtomicU64>,
    kill_grace: Duration,
}

impl ProcessManager {
    pub fn new(command: ProcessCommand) -> Self {
        Self {
            command,
            slot: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Start a new invocation, superseding whatever is currently running.
    ///
    /// Spawn failures do not surface as errors: the returned handle has no
    /// deltas and its exit carries the failure text.
    pub async fn spawn(&self, session_id: &str, work_dir: &Path, message: &str) -> ProcessHandle {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
            let exit = wait_exit(previous.exit).await;
            tracing::info!(
                target = "session_relay::process",
                superseded = previous.id,
                code = ?exit.code,
                "terminated previous assistant process"
            );
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        match self.build_command(session_id, work_dir, message).spawn() {
            Ok(child) => {
                tracing::info!(
                    target = "session_relay::process",
                    id,
                    pid = ?child.id(),
                    session_id = %session_id,
                    cwd = %work_dir.display(),
                    "spawned assistant process"
                );
                *slot = Some(ActiveProcess {
                    id,
                    cancel: cancel.clone(),
                    exit: exit_rx.clone(),
                });
                tokio::spawn(drive_process(
                    child,
                    delta_tx,
                    exit_tx,
                    cancel.clone(),
                    Arc::clone(&self.slot),
                    id,
                    self.kill_grace,
                ));
            }
            Err(error) => {
                tracing::error!(
                    target = "session_relay::process",
                    program = %self.command.program,
                    cwd = %work_dir.display(),
                    error = %error,
                    "failed to spawn assistant process"
                );
                exit_tx.send_replace(Some(ProcessExit {
                    code: None,
                    killed: false,
                    error_text: Some(format!("failed to start {}: {error}", self.command.program)),
                }));
            }
        }

        ProcessHandle {
            id,
            deltas: delta_rx,
            exit: exit_rx,
            cancel,
        }
    }

    /// Kill the tracked subprocess, if any, without starting a new one.
    pub async fn kill_current(&self) {
        if let Some(active) = self.slot.lock().await.take() {
            active.cancel.cancel();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    fn build_command(&self, session_id: &str, work_dir: &Path, message: &str) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(self.command.resume_args(session_id, message))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in STRIPPED_ENV_VARS {
            cmd.env_remove(key);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

async fn drive_process(
    mut child: Child,
    delta_tx: mpsc::UnboundedSender<String>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    cancel: CancellationToken,
    slot: Arc<Mutex<Option<ActiveProcess>>>,
    id: u64,
    kill_grace: Duration,
) {
    let stderr_task = tokio::spawn(drain_to_string(child.stderr.take()));
    let mut decoder = StreamDecoder::new();
    let mut killed = false;

    if let Some(mut stdout) = child.stdout.take() {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    killed = true;
                    break;
                }
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for delta in decoder.push(&chunk[..n]) {
                            let _ = delta_tx.send(delta);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(target = "session_relay::process", id, error = %error, "stdout read failed");
                        break;
                    }
                }
            }
        }
    }
    if !killed {
        if let Some(delta) = decoder.finish() {
            let _ = delta_tx.send(delta);
        }
    }
    drop(delta_tx);

    let status = if killed {
        terminate_child(&mut child, kill_grace).await
    } else {
        tokio::select! {
            status = child.wait() => status.ok(),
            _ = cancel.cancelled() => {
                killed = true;
                terminate_child(&mut child, kill_grace).await
            }
        }
    };

    let stderr_text = collect_stderr(stderr_task, STDERR_DRAIN_TIMEOUT).await;
    let exit = summarize_exit(status, killed, !decoder.full_text().is_empty(), stderr_text);

    if exit.killed {
        tracing::info!(target = "session_relay::process", id, "assistant process killed");
    } else if exit.code == Some(0) {
        tracing::info!(target = "session_relay::process", id, "assistant process exited");
    } else {
        tracing::error!(
            target = "session_relay::process",
            id,
            code = ?exit.code,
            stderr = exit.error_text.as_deref().unwrap_or(""),
            "assistant process exited with error"
        );
    }

    exit_tx.send_replace(Some(exit));

    let mut slot = slot.lock().await;
    if slot.as_ref().is_some_and(|active| active.id == id) {
        *slot = None;
    }
}

fn summarize_exit(
    status: Option<ExitStatus>,
    killed: bool,
    produced_text: bool,
    stderr_text: String,
) -> ProcessExit {
    let success = status.is_some_and(|status| status.success());
    let error_text = if !killed && (!success || !produced_text) && !stderr_text.is_empty() {
        Some(stderr_text)
    } else {
        None
    };
    ProcessExit {
        code: status.and_then(|status| status.code()),
        killed,
        error_text,
    }
}

/// Wait up to `limit` for the stderr reader. A descendant that inherited
/// the pipe can hold it open forever, so a late reader is aborted.
async fn collect_stderr(mut task: JoinHandle<String>, limit: Duration) -> String {
    match timeout(limit, &mut task).await {
        Ok(Ok(text)) => text.trim().to_string(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

async fn drain_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut bytes = Vec::new();
    let _ = reader.read_to_end(&mut bytes).await;
    String::from_utf8_lossy(&bytes).into_owned()
}

/// SIGTERM the child's process group, escalating to SIGKILL after `grace`.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
            }
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}
