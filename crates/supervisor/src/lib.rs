//! Supervision of the separately packaged worker process.
//!
//! [`ProcessSupervisor`] owns at most one live worker at a time. It resolves
//! the executable, spawns it with captured output, waits for its TCP port to
//! accept connections, and restarts it after crash exits within the bounds of
//! a [`RestartPolicy`]. Everything observable is published as a
//! [`SupervisorEvent`].

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    domain::LogLevel,
    error::{Fault, FaultKind},
    subscription::{listen, Subscription},
};
use tokio::{
    process::Child,
    sync::{broadcast, oneshot},
};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub mod config;
pub mod error;
mod process;

pub use config::{default_candidates, resolve_executable, RestartPolicy, SupervisorConfig};
pub use error::SupervisorError;

/// Events buffered per listener; a listener further behind skips the oldest.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The process had already been released by `stop()` and a newer one is live.
    pub superseded: bool,
}

impl ExitInfo {
    /// Only a zero exit code is clean; a signal death counts as a crash.
    pub fn kind(&self) -> FaultKind {
        if self.code == Some(0) {
            FaultKind::CleanExit
        } else {
            FaultKind::CrashExit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerLog {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Ready,
    Exit(ExitInfo),
    Log(WorkerLog),
    Error(Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProcessStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Manual,
    AutoRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    TimedOut,
    ProcessGone,
}

struct ManagedProcess {
    generation: u64,
    pid: u32,
    executable: PathBuf,
    started_at: Instant,
    force_kill: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct SupervisorState {
    process: Option<ManagedProcess>,
    restart_count: u32,
    shutdown_requested: bool,
    next_generation: u64,
}

impl SupervisorState {
    fn begin_process(
        &mut self,
        pid: u32,
        executable: PathBuf,
        force_kill: oneshot::Sender<()>,
    ) -> u64 {
        debug_assert!(self.process.is_none(), "a worker handle is already live");
        self.next_generation += 1;
        let generation = self.next_generation;
        self.process = Some(ManagedProcess {
            generation,
            pid,
            executable,
            started_at: Instant::now(),
            force_kill: Some(force_kill),
        });
        generation
    }

    /// Clears the handle if it still belongs to `generation`.
    fn end_process(&mut self, generation: u64) -> Option<ManagedProcess> {
        if self.is_current(generation) {
            self.process.take()
        } else {
            None
        }
    }

    fn release_process(&mut self) -> Option<ManagedProcess> {
        self.process.take()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.process
            .as_ref()
            .is_some_and(|process| process.generation == generation)
    }
}

struct Inner {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
    span: Span,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_span(config, info_span!("supervisor"))
    }

    /// Builds a supervisor whose logging is recorded under `span`.
    pub fn with_span(config: SupervisorConfig, span: Span) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SupervisorState::default()),
                events,
                span,
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Spawns the worker and waits (bounded by the startup timeout) for its
    /// port to accept connections. A no-op while a worker is live.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let span = self.inner.span.clone();
        self.inner.start(StartMode::Manual).instrument(span).await
    }

    /// Releases the worker immediately and terminates it in the background.
    /// Suppresses any auto-restart that is pending or would follow the exit.
    pub fn stop(&self) {
        let _entered = self.inner.span.enter();
        self.inner.stop();
    }

    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let span = self.inner.span.clone();
        let inner = Arc::clone(&self.inner);
        async move {
            info!("restarting worker");
            inner.stop();
            tokio::time::sleep(inner.config.restart_pause).await;
            inner.lock_state().restart_count = 0;
            inner.start(StartMode::Manual).await
        }
        .instrument(span)
        .await
    }

    pub fn status(&self) -> ProcessStatus {
        let state = self.inner.lock_state();
        match &state.process {
            Some(process) => ProcessStatus {
                running: true,
                pid: Some(process.pid),
                uptime_ms: Some(duration_ms(process.started_at.elapsed())),
            },
            None => ProcessStatus::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().process.is_some()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.lock_state().restart_count
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Registers `handler` for every subsequent event.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(SupervisorEvent) + Send + 'static,
    {
        listen("supervisor", self.subscribe_events(), handler)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    async fn start(self: &Arc<Self>, mode: StartMode) -> Result<(), SupervisorError> {
        let generation = match self.spawn_worker(mode)? {
            Some(generation) => generation,
            None => return Ok(()),
        };

        match self.wait_for_ready(generation).await {
            Readiness::ProcessGone => {
                debug!(generation, "worker exited before becoming ready");
                return Ok(());
            }
            Readiness::TimedOut => {
                warn!(
                    addr = %self.config.ready_addr(),
                    "worker readiness check timed out, continuing anyway"
                );
            }
            Readiness::Ready => {}
        }

        {
            let mut state = self.lock_state();
            if !state.is_current(generation) {
                debug!(generation, "worker was replaced while waiting for readiness");
                return Ok(());
            }
            state.restart_count = 0;
        }
        info!("worker is ready");
        self.emit(SupervisorEvent::Ready);
        Ok(())
    }

    /// Resolves and spawns the worker under the state lock. Returns the new
    /// generation, or `None` when nothing was started.
    fn spawn_worker(self: &Arc<Self>, mode: StartMode) -> Result<Option<u64>, SupervisorError> {
        let mut state = self.lock_state();

        if let Some(process) = &state.process {
            info!(pid = process.pid, "worker already running");
            return Ok(None);
        }
        if mode == StartMode::AutoRestart && state.shutdown_requested {
            debug!("shutdown requested during restart delay; skipping restart");
            return Ok(None);
        }
        state.shutdown_requested = false;

        let executable = resolve_executable(&self.config.candidates).unwrap_or_default();
        info!(path = %executable.display(), "starting worker");
        if !executable.is_file() {
            error!(path = %executable.display(), "worker executable not found");
            return Err(SupervisorError::ExecutableNotFound { path: executable });
        }
        let executable = std::fs::canonicalize(&executable).unwrap_or(executable);

        let mut child = match process::build_command(&executable, &self.config.args).spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::SpawnFailure {
                    path: executable,
                    source,
                };
                error!(%err, "failed to spawn worker");
                self.emit(SupervisorEvent::Error(Fault::from(&err)));
                return Err(err);
            }
        };

        let pid = match worker_pid(child.id(), &executable) {
            Ok(pid) => pid,
            Err(err) => {
                let _ = child.start_kill();
                error!(%err, "failed to spawn worker");
                self.emit(SupervisorEvent::Error(Fault::from(&err)));
                return Err(err);
            }
        };
        let (force_kill_tx, force_kill_rx) = oneshot::channel();
        let generation = state.begin_process(pid, executable, force_kill_tx);
        info!(pid, generation, "worker spawned");

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            tokio::spawn(
                process::pump_lines(stdout, LogLevel::Info, events).instrument(self.span.clone()),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            let events = self.events.clone();
            tokio::spawn(
                process::pump_lines(stderr, LogLevel::Error, events).instrument(self.span.clone()),
            );
        }
        self.spawn_monitor(child, generation, pid, force_kill_rx);

        Ok(Some(generation))
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        mut child: Child,
        generation: u64,
        pid: u32,
        mut force_kill: oneshot::Receiver<()>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(
            async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    Ok(()) = &mut force_kill => {
                        warn!(pid, "force killing worker");
                        if let Err(err) = child.start_kill() {
                            debug!(pid, %err, "force kill failed");
                        }
                        child.wait().await
                    }
                };
                inner.handle_exit(generation, pid, status);
            }
            .instrument(self.span.clone()),
        );
    }

    async fn wait_for_ready(&self, generation: u64) -> Readiness {
        let addr = self.config.ready_addr();
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if !self.lock_state().is_current(generation) {
                return Readiness::ProcessGone;
            }
            if process::probe_port(&addr, self.config.probe_timeout).await {
                return Readiness::Ready;
            }
            if Instant::now() >= deadline {
                return Readiness::TimedOut;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn stop(&self) {
        let released = {
            let mut state = self.lock_state();
            state.shutdown_requested = true;
            state.release_process()
        };
        let Some(mut process) = released else {
            debug!("worker not running");
            return;
        };
        info!(pid = process.pid, path = %process.executable.display(), "stopping worker");
        let force_kill = process.force_kill.take();

        #[cfg(windows)]
        {
            drop(force_kill);
            process::kill_tree(process.pid);
        }

        #[cfg(unix)]
        {
            if process::request_terminate(process.pid) {
                let grace = self.config.stop_grace;
                tokio::spawn(
                    async move {
                        tokio::time::sleep(grace).await;
                        if let Some(force_kill) = force_kill {
                            let _ = force_kill.send(());
                        }
                    }
                    .instrument(self.span.clone()),
                );
            }
        }
    }

    fn handle_exit(
        self: &Arc<Self>,
        generation: u64,
        pid: u32,
        status: std::io::Result<std::process::ExitStatus>,
    ) {
        let (code, signal) = match &status {
            Ok(status) => (status.code(), process::exit_signal(status)),
            Err(err) => {
                warn!(pid, %err, "failed to collect worker exit status");
                (None, None)
            }
        };

        let (ended, superseded) = {
            let mut state = self.lock_state();
            let ended = state.end_process(generation);
            let superseded = ended.is_none() && state.process.is_some();
            (ended, superseded)
        };
        let uptime_ms = ended
            .as_ref()
            .map(|process| duration_ms(process.started_at.elapsed()));
        info!(pid, ?code, ?signal, ?uptime_ms, "worker exited");

        let exit = ExitInfo {
            pid,
            code,
            signal,
            superseded,
        };
        let kind = exit.kind();
        self.emit(SupervisorEvent::Exit(exit));

        if ended.is_none() {
            debug!(pid, "released worker exited; auto-restart not evaluated");
            return;
        }
        self.evaluate_restart(kind);
    }

    fn evaluate_restart(self: &Arc<Self>, kind: FaultKind) {
        let policy = self.config.restart;
        let attempt = {
            let mut state = self.lock_state();
            if state.shutdown_requested {
                debug!("shutdown in progress, skipping auto-restart");
                return;
            }
            if kind == FaultKind::CleanExit {
                debug!("clean exit, skipping auto-restart");
                return;
            }
            if state.restart_count >= policy.max_attempts {
                let message = format!(
                    "worker restart budget exhausted after {} attempts; manual restart required",
                    state.restart_count
                );
                error!(
                    attempts = state.restart_count,
                    max = policy.max_attempts,
                    "max restart attempts reached"
                );
                drop(state);
                self.emit(SupervisorEvent::Log(WorkerLog {
                    level: LogLevel::Error,
                    message: message.clone(),
                    at: Utc::now(),
                }));
                self.emit(SupervisorEvent::Error(Fault::new(
                    FaultKind::RestartBudgetExhausted,
                    message,
                )));
                return;
            }
            state.restart_count += 1;
            state.restart_count
        };

        info!(
            attempt,
            max = policy.max_attempts,
            delay_ms = duration_ms(policy.delay),
            "scheduling auto-restart"
        );
        let inner = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::time::sleep(policy.delay).await;
                if let Err(err) = inner.start(StartMode::AutoRestart).await {
                    error!(%err, "auto-restart failed");
                }
            }
            .instrument(self.span.clone()),
        );
    }
}

/// A spawned worker must report a real pid; 0 would make signal delivery
/// target the host's own process group.
fn worker_pid(id: Option<u32>, executable: &Path) -> Result<u32, SupervisorError> {
    id.filter(|pid| *pid != 0)
        .ok_or_else(|| SupervisorError::SpawnFailure {
            path: executable.to_path_buf(),
            source: std::io::Error::other("spawned worker reported no pid"),
        })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
