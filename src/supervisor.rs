//! Engine process lifecycle: spawn, crash detection, bounded restarts and
//! teardown.
//!
//! ```text
//! Starting -> Ready -> (Crashed -> Restarting -> Ready)* -> Degraded
//!             Ready -> Stopping -> Stopped
//! ```
//!
//! A single supervision task owns the child. It waits on process exit and on
//! the stop signal at the same time, so a crash during shutdown is still a
//! clean stop. Children are spawned with `kill_on_drop`, so dropping the task
//! (runtime shutdown, panic) also reaps the process.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Crashed,
    Restarting,
    Degraded,
    Stopping,
    Stopped,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Degraded | ProcessState::Stopped)
    }
}

/// How to launch the engine.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, PathBuf)>,
}

impl EngineCommand {
    /// clangd with the fixed argument set.
    pub fn clangd(program: &Path, project_root: &Path, compile_commands_dir: &Path) -> Self {
        let args = [
            "--background-index",
            "--header-insertion=never",
            "--clang-tidy=false",
            "--completion-style=detailed",
            "--pch-storage=memory",
            "--malloc-trim",
            "--log=error",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(format!(
            "--compile-commands-dir={}",
            compile_commands_dir.display()
        )))
        .collect();
        Self {
            program: program.to_path_buf(),
            args,
            cwd: project_root.to_path_buf(),
            env: Vec::new(),
        }
    }

    /// Keep the engine's index under `dir` instead of its default cache home.
    pub fn with_index_dir(mut self, dir: &Path) -> Self {
        self.env.push(("XDG_CACHE_HOME".to_string(), dir.to_path_buf()));
        self
    }

    pub fn new(program: impl Into<PathBuf>, args: &[&str], cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    /// Delay before the first restart; doubles for each later one.
    pub backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Pipes of a freshly spawned engine.
pub struct EngineIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub pid: Option<u32>,
}

/// Snapshot of the supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub restart_count: u32,
    pub spawn_count: u32,
    pub last_crash: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tracking {
    pid: Option<u32>,
    restart_count: u32,
    spawn_count: u32,
    last_crash: Option<DateTime<Utc>>,
}

struct Inner {
    command: EngineCommand,
    policy: RestartPolicy,
    state: watch::Sender<ProcessState>,
    tracking: Mutex<Tracking>,
    /// Pipes of restarted processes, for the client to re-attach.
    restarts: mpsc::UnboundedSender<EngineIo>,
    stop: watch::Sender<bool>,
}

pub struct ProcessSupervisor {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Spawn the engine and start supervising it.
    ///
    /// Returns the first process's pipes and a receiver for the pipes of
    /// every later restart. A spawn failure here is fatal.
    pub fn start(
        command: EngineCommand,
        policy: RestartPolicy,
    ) -> Result<(Self, EngineIo, mpsc::UnboundedReceiver<EngineIo>)> {
        let (restarts_tx, restarts_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ProcessState::Starting);
        let (stop, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            command,
            policy,
            state,
            tracking: Mutex::new(Tracking::default()),
            restarts: restarts_tx,
            stop,
        });

        let (child, io) = match inner.spawn() {
            Ok(spawned) => spawned,
            Err(err) => {
                inner.state.send_replace(ProcessState::Stopped);
                return Err(err);
            }
        };
        inner.state.send_replace(ProcessState::Ready);

        let task = tokio::spawn(supervise(inner.clone(), child));
        Ok((
            Self {
                inner,
                task: Mutex::new(Some(task)),
            },
            io,
            restarts_rx,
        ))
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.inner.state.subscribe()
    }

    pub fn is_restarting(&self) -> bool {
        matches!(
            self.state(),
            ProcessState::Crashed | ProcessState::Restarting
        )
    }

    pub fn handle(&self) -> ProcessHandle {
        let tracking = self.inner.tracking.lock();
        let (pid, restart_count, spawn_count, last_crash) = match tracking {
            Ok(t) => (t.pid, t.restart_count, t.spawn_count, t.last_crash),
            Err(_) => (None, 0, 0, None),
        };
        ProcessHandle {
            pid,
            state: self.state(),
            restart_count,
            spawn_count,
            last_crash,
        }
    }

    /// Terminate gracefully, force-kill after the grace period, and wait for
    /// the supervision task to finish.
    pub async fn shutdown(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        let Some(task) = task else { return };

        if !self.state().is_terminal() {
            self.inner.state.send_replace(ProcessState::Stopping);
        }
        self.inner.stop.send_replace(true);

        let limit = self.inner.policy.shutdown_grace + Duration::from_secs(2);
        let abort = task.abort_handle();
        if tokio::time::timeout(limit, task).await.is_err() {
            warn!("engine supervisor did not stop in time; aborting");
            // dropping the task drops the child, which kills it
            abort.abort();
        }
        if self.state() != ProcessState::Degraded {
            self.inner.state.send_replace(ProcessState::Stopped);
        }
        info!("engine stopped");
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Inner {
    fn spawn(&self) -> Result<(Child, EngineIo)> {
        let program = self.command.program.display().to_string();
        debug!("spawning {program} {}", self.command.args.join(" "));
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&self.command.cwd)
            .envs(self.command.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AnalysisError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AnalysisError::Spawn {
                program,
                source: std::io::Error::other("child pipes unavailable"),
            });
        };
        let pid = child.id();
        if let Ok(mut tracking) = self.tracking.lock() {
            tracking.pid = pid;
            tracking.spawn_count += 1;
        }
        info!("engine started (pid {})", pid.map(|p| p.to_string()).unwrap_or_default());
        Ok((child, EngineIo { stdin, stdout, pid }))
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Wait for `delay` unless a stop is requested first. Returns false on stop.
async fn sleep_unless_stopped(inner: &Inner, delay: Duration) -> bool {
    let mut stop = inner.stop.subscribe();
    if *stop.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop.changed() => false,
    }
}

async fn supervise(inner: Arc<Inner>, mut child: Child) {
    let mut stop = inner.stop.subscribe();
    loop {
        let started = Instant::now();
        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop.wait_for(|stop| *stop) => None,
        };

        let Some(status) = exit else {
            terminate(&mut child, inner.policy.shutdown_grace).await;
            return;
        };
        if inner.stopping() {
            debug!("engine exited during shutdown");
            return;
        }

        let status = match status {
            Ok(status) => status.to_string(),
            Err(err) => format!("wait failed: {err}"),
        };
        error!(
            "engine crashed after {:.1}s ({status})",
            started.elapsed().as_secs_f32()
        );
        inner.state.send_replace(ProcessState::Crashed);
        if let Ok(mut tracking) = inner.tracking.lock() {
            tracking.pid = None;
            tracking.last_crash = Some(Utc::now());
        }

        match restart(&inner).await {
            Some((next, io)) => {
                child = next;
                if inner.restarts.send(io).is_err() {
                    debug!("nobody is listening for engine restarts");
                }
            }
            None => return,
        }
    }
}

/// Restart with backoff until a spawn succeeds or the budget is spent.
async fn restart(inner: &Inner) -> Option<(Child, EngineIo)> {
    loop {
        let attempt = {
            let Ok(mut tracking) = inner.tracking.lock() else {
                return None;
            };
            if tracking.restart_count >= inner.policy.max_restarts {
                None
            } else {
                tracking.restart_count += 1;
                Some(tracking.restart_count)
            }
        };
        let Some(attempt) = attempt else {
            error!(
                "engine restart limit ({}) reached; semantic analysis disabled for this session",
                inner.policy.max_restarts
            );
            inner.state.send_replace(ProcessState::Degraded);
            return None;
        };

        inner.state.send_replace(ProcessState::Restarting);
        let delay = inner.policy.backoff * 2u32.saturating_pow(attempt - 1);
        warn!(
            "restarting engine in {delay:?} (attempt {attempt}/{})",
            inner.policy.max_restarts
        );
        if !sleep_unless_stopped(inner, delay).await {
            return None;
        }
        match inner.spawn() {
            Ok(spawned) => {
                inner.state.send_replace(ProcessState::Ready);
                return Some(spawned);
            }
            Err(err) => {
                error!("engine restart failed: {err}");
                if let Ok(mut tracking) = inner.tracking.lock() {
                    tracking.last_crash = Some(Utc::now());
                }
            }
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    send_terminate(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("engine exited after terminate signal"),
        Err(_) => {
            warn!("engine ignored terminate signal for {grace:?}; killing");
            if let Err(err) = child.kill().await {
                warn!("failed to kill engine: {err}");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to our own child; the pid is live
        // because the child has not been reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}
