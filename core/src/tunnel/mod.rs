//! Local port forwarding to a compute node: the "tunnel" subsystem.
//!
//! `TunnelManager` owns at most one tunnel subprocess. The subprocess opens a
//! listener on `127.0.0.1:<local_port>` and forwards every accepted connection
//! over its own authenticated channel to `<target_host>:<target_port>` (see
//! `forward`). Its stdout is a control channel carrying exactly one line, the
//! ready marker (see `marker`); human-readable logs go to stderr.

pub mod forward;
pub mod marker;

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{HpcError, Result};
use crate::remote::Credentials;

pub use marker::ReadyMarker;

/// File name of the tunnel subprocess binary.
pub const TUNNEL_BINARY: &str = "hpcserve-tunnel";

const STDERR_TAIL_LINES: usize = 20;


// ---------------------------------------------------------------------------
// Tunnel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TunnelState {
    Stopped,
    Starting,
    Listening,
    Errored { reason: String },
}

/// The managed tunnel as callers see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Pid of the backing subprocess.
    pub pid: Option<u32>,
    pub state: TunnelState,
}

/// Program used as the tunnel subprocess. The six positional arguments are
/// appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelProgram {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TunnelProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        TunnelProgram {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// `hpcserve-tunnel` installed next to the running executable.
    pub fn sibling_binary() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| HpcError::Config("cannot locate the executable's directory".into()))?;
        Ok(TunnelProgram::new(dir.join(TUNNEL_BINARY)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// How long a start waits for the ready marker.
    pub ready_timeout: Duration,
    /// How long a stop waits after SIGTERM before SIGKILL.
    pub stop_grace: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        TunnelOptions {
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(3),
        }
    }
}


// ---------------------------------------------------------------------------
// Process bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ExitInfo {
    description: String,
}

impl ExitInfo {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        let description = match result {
            Ok(status) => describe_status(status),
            Err(e) => format!("wait failed: {}", e),
        };
        ExitInfo { description }
    }

    fn lost() -> Self {
        ExitInfo {
            description: "exit status lost".to_string(),
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exit status {}", code)
    } else if let Some(signal) = status.signal() {
        format!("killed by signal {}", signal)
    } else {
        "unknown exit".to_string()
    }
}

/// Handle to a live subprocess. Dropping it kills the process.
struct ProcessHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: Option<oneshot::Sender<()>>,
    stop_requested: Arc<AtomicBool>,
}

/// Per-start receivers the starting caller waits on.
struct Pending {
    generation: u64,
    ready: oneshot::Receiver<ReadyMarker>,
    exit: watch::Receiver<Option<ExitInfo>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: JoinHandle<()>,
    stop_requested: Arc<AtomicBool>,
}

struct Inner {
    tunnel: Option<Tunnel>,
    process: Option<ProcessHandle>,
    generation: u64,
}

enum Plan {
    Existing(Tunnel),
    AwaitOther,
    Spawned(Pending),
}

enum Wait {
    Ready(std::result::Result<ReadyMarker, oneshot::error::RecvError>),
    Exited(ExitInfo),
    TimedOut,
    Cancelled,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(info) = current {
            return info;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(ExitInfo::lost);
        }
    }
}

async fn wait_settled(rx: &mut watch::Receiver<TunnelState>) -> TunnelState {
    loop {
        let current = rx.borrow_and_update().clone();
        if current != TunnelState::Starting {
            return current;
        }
        if rx.changed().await.is_err() {
            return TunnelState::Stopped;
        }
    }
}

fn tail_text(tail: &Mutex<VecDeque<String>>) -> String {
    let lines = lock(tail);
    if lines.is_empty() {
        String::new()
    } else {
        format!(": {}", lines.iter().cloned().collect::<Vec<_>>().join(" | "))
    }
}


// ---------------------------------------------------------------------------
// TunnelManager
// ---------------------------------------------------------------------------

/// Owns one tunnel subprocess at a time.
pub struct TunnelManager {
    program: TunnelProgram,
    options: TunnelOptions,
    state: Arc<watch::Sender<TunnelState>>,
    inner: Arc<Mutex<Inner>>,
}

impl TunnelManager {
    pub fn new(program: TunnelProgram, options: TunnelOptions) -> Self {
        let (state, _) = watch::channel(TunnelState::Stopped);
        TunnelManager {
            program,
            options,
            state: Arc::new(state),
            inner: Arc::new(Mutex::new(Inner {
                tunnel: None,
                process: None,
                generation: 0,
            })),
        }
    }

    pub fn status(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// The current tunnel, if one has been started and not stopped.
    pub fn tunnel(&self) -> Option<Tunnel> {
        let state = self.status();
        lock(&self.inner).tunnel.clone().map(|mut t| {
            t.state = state;
            t
        })
    }

    /// Start forwarding `127.0.0.1:local_port` to `target_host:remote_port`.
    ///
    /// Idempotent: while a tunnel is Listening this returns it at once, and
    /// while one is Starting this waits for that start instead of spawning a
    /// second subprocess.
    pub async fn start_tunnel(
        &self,
        credentials: &Credentials,
        target_host: &str,
        remote_port: u16,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<Tunnel> {
        let plan = {
            let mut inner = lock(&self.inner);
            match self.status() {
                TunnelState::Listening => {
                    let tunnel = inner
                        .tunnel
                        .clone()
                        .ok_or_else(|| HpcError::Tunnel("listening tunnel has no record".into()))?;
                    if tunnel.target_host != target_host
                        || tunnel.target_port != remote_port
                        || tunnel.local_port != local_port
                    {
                        tracing::warn!(
                            current = %format!("{}:{}", tunnel.target_host, tunnel.target_port),
                            requested = %format!("{}:{}", target_host, remote_port),
                            "tunnel already listening for a different target"
                        );
                    }
                    Plan::Existing(Tunnel {
                        state: TunnelState::Listening,
                        ..tunnel
                    })
                }
                TunnelState::Starting => Plan::AwaitOther,
                TunnelState::Stopped | TunnelState::Errored { .. } => {
                    inner.process = None;
                    inner.tunnel = None;
                    inner.generation += 1;
                    let generation = inner.generation;
                    let pending = self.spawn(
                        &mut inner,
                        generation,
                        credentials,
                        target_host,
                        remote_port,
                        local_port,
                    )?;
                    Plan::Spawned(pending)
                }
            }
        };

        match plan {
            Plan::Existing(tunnel) => Ok(tunnel),
            Plan::AwaitOther => self.await_other_start(cancel).await,
            Plan::Spawned(pending) => {
                self.await_ready(pending, target_host, remote_port, local_port, cancel)
                    .await
            }
        }
    }

    /// Spawn the subprocess and its reader and waiter tasks. Runs under the
    /// inner lock; nothing here awaits.
    fn spawn(
        &self,
        inner: &mut Inner,
        generation: u64,
        credentials: &Credentials,
        target_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Pending> {
        let mut command = Command::new(&self.program.program);
        command.args(&self.program.args);
        if credentials.port != 22 {
            command.arg("--ssh-port").arg(credentials.port.to_string());
        }
        command
            .arg(&credentials.host)
            .arg(&credentials.username)
            .arg(credentials.secret.as_arg())
            .arg(target_host)
            .arg(remote_port.to_string())
            .arg(local_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!(
                    "failed to launch {}: {}",
                    self.program.program.display(),
                    e
                );
                self.state.send_replace(TunnelState::Errored {
                    reason: reason.clone(),
                });
                return Err(HpcError::Tunnel(reason));
            }
        };
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut ready_tx = Some(ready_tx);
            while let Ok(Some(line)) = lines.next_line().await {
                match ReadyMarker::parse(&line) {
                    Some(marker) if ready_tx.is_some() => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(marker);
                        }
                    }
                    _ => tracing::debug!(line = %line, "tunnel stdout"),
                }
            }
        });

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let tail = Arc::clone(&stderr_tail);
        let stderr_reader = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(pid = ?pid, "tunnel: {}", line);
                let mut tail = lock(&tail);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let waiter_stop = Arc::clone(&stop_requested);
        let waiter_inner = Arc::clone(&self.inner);
        let waiter_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = ExitInfo::from_wait(status);

            let inner = lock(&waiter_inner);
            let _ = exit_tx.send(Some(info.clone()));
            let current = inner.generation == generation;
            if current && !waiter_stop.load(Ordering::SeqCst) {
                let crashed = waiter_state.send_if_modified(|state| {
                    if *state == TunnelState::Listening {
                        *state = TunnelState::Errored {
                            reason: format!("tunnel exited after ready ({})", info.description),
                        };
                        true
                    } else {
                        false
                    }
                });
                if crashed {
                    tracing::error!(pid = ?pid, exit = %info.description, "tunnel subprocess died");
                }
            }
        });

        inner.tunnel = Some(Tunnel {
            local_port,
            target_host: target_host.to_string(),
            target_port: remote_port,
            pid,
            state: TunnelState::Starting,
        });
        inner.process = Some(ProcessHandle {
            pid,
            exit: exit_rx.clone(),
            kill: Some(kill_tx),
            stop_requested: Arc::clone(&stop_requested),
        });
        self.state.send_replace(TunnelState::Starting);
        tracing::info!(
            pid = ?pid,
            target = %format!("{}:{}", target_host, remote_port),
            local_port,
            "tunnel subprocess spawned"
        );

        Ok(Pending {
            generation,
            ready: ready_rx,
            exit: exit_rx,
            stderr_tail,
            stderr_reader,
            stop_requested,
        })
    }

    async fn await_ready(
        &self,
        mut pending: Pending,
        target_host: &str,
        remote_port: u16,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<Tunnel> {
        let wait = tokio::select! {
            marker = &mut pending.ready => Wait::Ready(marker),
            info = wait_exit(&mut pending.exit) => Wait::Exited(info),
            _ = tokio::time::sleep(self.options.ready_timeout) => Wait::TimedOut,
            _ = cancel.cancelled() => Wait::Cancelled,
        };

        let failure = match wait {
            Wait::Ready(Ok(marker)) if marker.matches(target_host, remote_port, local_port) => {
                let inner = lock(&self.inner);
                let exited = pending.exit.borrow().clone();
                if inner.generation == pending.generation && exited.is_none() {
                    self.state.send_replace(TunnelState::Listening);
                    tracing::info!(%marker, "tunnel ready");
                    let tunnel = inner.tunnel.clone().map(|t| Tunnel {
                        state: TunnelState::Listening,
                        ..t
                    });
                    return tunnel.ok_or_else(|| HpcError::Tunnel("tunnel record vanished".into()));
                }
                if pending.stop_requested.load(Ordering::SeqCst) {
                    return Err(HpcError::Cancelled("tunnel stopped while starting".into()));
                }
                let info = exited.unwrap_or_else(ExitInfo::lost);
                HpcError::Tunnel(format!("tunnel exited right after ready ({})", info.description))
            }
            Wait::Ready(Ok(marker)) => HpcError::Tunnel(format!(
                "unexpected ready marker '{}' (wanted 127.0.0.1:{} -> {}:{})",
                marker, local_port, target_host, remote_port
            )),
            Wait::Exited(info) => Self::early_exit(&mut pending, info).await?,
            Wait::Ready(Err(_)) => {
                // Stdout closed without a marker; the exit follows shortly.
                let info = tokio::time::timeout(self.options.stop_grace, wait_exit(&mut pending.exit))
                    .await
                    .unwrap_or_else(|_| ExitInfo::lost());
                Self::early_exit(&mut pending, info).await?
            }
            Wait::TimedOut => HpcError::timeout("tunnel ready marker", self.options.ready_timeout),
            Wait::Cancelled => HpcError::Cancelled("tunnel start cancelled".into()),
        };

        self.abort_start(pending.generation, failure).await
    }

    /// The failure for a subprocess that exited before its marker, with the
    /// tail of its stderr. A stop issued meanwhile makes this a cancellation.
    async fn early_exit(pending: &mut Pending, info: ExitInfo) -> Result<HpcError> {
        if pending.stop_requested.load(Ordering::SeqCst) {
            return Err(HpcError::Cancelled("tunnel stopped while starting".into()));
        }
        let _ = tokio::time::timeout(Duration::from_millis(500), &mut pending.stderr_reader).await;
        Ok(HpcError::Tunnel(format!(
            "tunnel exited before ready ({}){}",
            info.description,
            tail_text(&pending.stderr_tail)
        )))
    }

    /// Kill a failed start's subprocess and record why it failed.
    async fn abort_start(&self, generation: u64, failure: HpcError) -> Result<Tunnel> {
        let handle = {
            let mut inner = lock(&self.inner);
            if inner.generation == generation {
                inner.process.take()
            } else {
                None
            }
        };
        if let Some(handle) = handle {
            self.terminate(handle).await;
        }

        {
            let mut inner = lock(&self.inner);
            if inner.generation == generation {
                inner.tunnel = None;
                let next = match failure {
                    HpcError::Cancelled(_) => TunnelState::Stopped,
                    ref other => TunnelState::Errored {
                        reason: other.to_string(),
                    },
                };
                self.state.send_replace(next);
            }
        }
        tracing::warn!(error = %failure, "tunnel start failed");
        Err(failure)
    }

    async fn await_other_start(&self, cancel: &CancellationToken) -> Result<Tunnel> {
        let mut rx = self.state.subscribe();
        let settled = tokio::select! {
            state = wait_settled(&mut rx) => state,
            _ = cancel.cancelled() => {
                return Err(HpcError::Cancelled("tunnel start cancelled".into()));
            }
        };
        match settled {
            TunnelState::Listening => self
                .tunnel()
                .ok_or_else(|| HpcError::Tunnel("tunnel record vanished".into())),
            TunnelState::Errored { reason } => Err(HpcError::Tunnel(reason)),
            TunnelState::Stopped | TunnelState::Starting => Err(HpcError::Cancelled(
                "tunnel stopped while starting".into(),
            )),
        }
    }

    /// Terminate the subprocess and reset to Stopped. Returns once the exit is
    /// confirmed. A no-op when nothing is running.
    pub async fn stop_tunnel(&self) -> Result<()> {
        let handle = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.process.take()
        };
        if let Some(handle) = handle {
            let pid = handle.pid;
            let info = self.terminate(handle).await;
            tracing::info!(pid = ?pid, exit = %info.description, "tunnel stopped");
        }
        let mut inner = lock(&self.inner);
        inner.tunnel = None;
        self.state.send_replace(TunnelState::Stopped);
        Ok(())
    }

    /// SIGTERM, wait `stop_grace`, then SIGKILL.
    async fn terminate(&self, mut handle: ProcessHandle) -> ExitInfo {
        handle.stop_requested.store(true, Ordering::SeqCst);
        let already_exited = handle.exit.borrow().is_some();
        if let (Some(pid), false) = (handle.pid, already_exited) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(self.options.stop_grace, wait_exit(&mut handle.exit)).await {
            Ok(info) => info,
            Err(_) => {
                tracing::warn!(pid = ?handle.pid, "tunnel ignored SIGTERM, killing");
                if let Some(kill) = handle.kill.take() {
                    let _ = kill.send(());
                }
                wait_exit(&mut handle.exit).await
            }
        }
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        // Dropping the handle fires the kill channel.
        lock(&self.inner).process.take();
    }
}
