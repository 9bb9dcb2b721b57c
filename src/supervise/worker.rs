//! One supervised OS process slot: spawn, confirmation, exit reaction,
//! backoff and graceful stop.

use std::{
    io,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    process::{Child, Command},
    sync::watch,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use super::{outputs, SuperviseError};
use crate::{config::ProgramSpec, logging::DaemonLog, signals};

const BACKOFF_CAP_SECS: u64 = 20;
/// How long a force-killed child gets to be reaped before we give up waiting.
const KILL_REAP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Backoff,
    Fatal,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Stopped => "Stopped",
            WorkerState::Starting => "Starting",
            WorkerState::Running => "Running",
            WorkerState::Stopping => "Stopping",
            WorkerState::Backoff => "Backoff",
            WorkerState::Fatal => "Fatal",
        }
    }

    fn is_idle(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Fatal)
    }
}

enum StopIntent {
    Idle,
    Backoff,
    Stopping { pid: Option<u32> },
    Active { pid: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub program: String,
    pub index: usize,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub started_at: Option<SystemTime>,
    pub uptime: Option<Duration>,
    pub restart_count: u32,
}

/// The spec currently in force for a fleet, shared with its workers and
/// swapped atomically on reload. Each spawn snapshots it, so policy-only
/// changes apply on the next spawn without a restart.
#[derive(Debug)]
pub struct SpecCell(RwLock<Arc<ProgramSpec>>);

impl SpecCell {
    pub fn new(spec: Arc<ProgramSpec>) -> Arc<Self> {
        Arc::new(Self(RwLock::new(spec)))
    }

    pub fn get(&self) -> Arc<ProgramSpec> {
        self.0.read().clone()
    }

    pub fn swap(&self, spec: Arc<ProgramSpec>) {
        *self.0.write() = spec;
    }
}

#[derive(Debug)]
struct WorkerShared {
    state: WorkerState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    started_at_wall: Option<SystemTime>,
    restart_count: u32,
    stop_requested: bool,
}

/// One program instance. The worker owns its OS process handle; all
/// lifecycle waits happen on a dedicated supervision task, and the short
/// mutex around the mutable fields is never held across an await.
#[derive(Debug)]
pub struct Worker {
    program: String,
    index: usize,
    spec: Arc<SpecCell>,
    shared: Mutex<WorkerShared>,
    state_tx: watch::Sender<WorkerState>,
    run_token: Mutex<CancellationToken>,
    log: DaemonLog,
}

enum Reaction {
    Idle,
    Backoff(Duration),
}

impl Worker {
    pub fn new(program: &str, index: usize, spec: Arc<SpecCell>, log: DaemonLog) -> Arc<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Stopped);
        Arc::new(Self {
            program: program.to_string(),
            index,
            spec,
            shared: Mutex::new(WorkerShared {
                state: WorkerState::Stopped,
                pid: None,
                started_at: None,
                started_at_wall: None,
                restart_count: 0,
                stop_requested: false,
            }),
            state_tx,
            run_token: Mutex::new(CancellationToken::new()),
            log,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lock().state
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let shared = self.shared.lock();
        let uptime = match shared.state {
            WorkerState::Starting | WorkerState::Running | WorkerState::Stopping => {
                shared.started_at.map(|at| at.elapsed())
            }
            _ => None,
        };
        WorkerSnapshot {
            program: self.program.clone(),
            index: self.index,
            pid: shared.pid,
            state: shared.state,
            started_at: shared.started_at_wall,
            uptime,
            restart_count: shared.restart_count,
        }
    }

    /// Spawns the slot if it is idle. `Ok(false)` means the slot was already
    /// occupied (start on a Starting/Running/Stopping/Backoff worker is a
    /// no-op, not an error).
    pub async fn start(self: &Arc<Self>) -> Result<bool, SuperviseError> {
        {
            let mut shared = self.shared.lock();
            if !shared.state.is_idle() {
                return Ok(false);
            }
            // Operator intent: a fresh start clears the retry history.
            shared.restart_count = 0;
            shared.stop_requested = false;
            self.transition(&mut shared, WorkerState::Starting);
        }

        let token = self.fresh_run_token();
        let spec = self.spec.get();
        match self.spawn_child(&spec).await {
            Ok(child) => {
                self.record_spawn(&child);
                self.log.info(format!(
                    "{}: spawned pid {}",
                    self.tag(),
                    child.id().unwrap_or_default()
                ));
                let worker = Arc::clone(self);
                tokio::spawn(worker.supervise(child, spec, token));
                Ok(true)
            }
            Err(source) => {
                {
                    let mut shared = self.shared.lock();
                    shared.pid = None;
                    self.transition(&mut shared, WorkerState::Fatal);
                }
                self.log
                    .error(format!("{}: spawn failed: {source}", self.tag()));
                Err(SuperviseError::SpawnFailed {
                    program: self.program.clone(),
                    index: self.index,
                    source,
                })
            }
        }
    }

    /// Stops the slot and waits for the child to be reaped. Graceful stops
    /// send the configured signal and escalate to SIGKILL after the grace
    /// period; `force` skips straight to SIGKILL. Idempotent: stopping an
    /// idle worker does nothing, a second concurrent stop just waits.
    fn stop_intent(&self) -> StopIntent {
        let mut shared = self.shared.lock();
        match shared.state {
            WorkerState::Stopped | WorkerState::Fatal => StopIntent::Idle,
            WorkerState::Backoff => {
                // No process to signal; cancel the pending retry and let
                // the supervision task settle into Stopped.
                shared.stop_requested = true;
                StopIntent::Backoff
            }
            WorkerState::Stopping => StopIntent::Stopping { pid: shared.pid },
            WorkerState::Starting | WorkerState::Running => {
                shared.stop_requested = true;
                let pid = shared.pid;
                self.transition(&mut shared, WorkerState::Stopping);
                StopIntent::Active { pid }
            }
        }
    }

    pub async fn stop(&self, force: bool) {
        let spec = self.spec.get();
        let pid = match self.stop_intent() {
            StopIntent::Idle => return,
            StopIntent::Backoff => {
                self.run_token.lock().cancel();
                self.wait_idle(KILL_REAP_WAIT).await;
                return;
            }
            StopIntent::Stopping { pid } => {
                if force {
                    // Escalate a graceful stop already in flight.
                    if let Some(pid) = pid {
                        if let Err(error) = signals::force_kill(pid) {
                            tracing::warn!(%error, worker = %self.tag(), "force kill failed");
                        }
                    }
                    self.wait_idle(KILL_REAP_WAIT).await;
                } else {
                    self.wait_idle(spec.stop_grace() + KILL_REAP_WAIT).await;
                }
                return;
            }
            StopIntent::Active { pid } => pid,
        };

        let Some(pid) = pid else {
            // Spawn still in flight; the supervision task will observe
            // stop_requested as soon as it records the child.
            self.wait_idle(spec.stop_grace() + KILL_REAP_WAIT).await;
            return;
        };

        if force {
            if let Err(error) = signals::force_kill(pid) {
                tracing::warn!(%error, worker = %self.tag(), "force kill failed");
            }
            self.wait_idle(KILL_REAP_WAIT).await;
            return;
        }

        let stop_signal = signals::to_unix_signal(spec.stop_signal);
        match signals::send_signal(pid, stop_signal) {
            Ok(()) => {
                if self.try_wait_idle(spec.stop_grace()).await {
                    return;
                }
                self.log.warning(format!(
                    "{}: did not exit within {}s after {}; sending SIGKILL",
                    self.tag(),
                    spec.stop_secs,
                    spec.stop_signal.as_str()
                ));
            }
            Err(error) => {
                self.log.warning(format!(
                    "{}: failed to send {}: {error}; sending SIGKILL",
                    self.tag(),
                    spec.stop_signal.as_str()
                ));
            }
        }

        if let Err(error) = signals::force_kill(pid) {
            tracing::warn!(%error, worker = %self.tag(), "force kill failed");
        }
        self.wait_idle(KILL_REAP_WAIT).await;
    }

    /// Delivers an operator-requested signal to the running child without
    /// changing the worker state.
    pub fn send_signal(&self, signal: nix::sys::signal::Signal) -> Result<(), SuperviseError> {
        let pid = {
            let shared = self.shared.lock();
            match shared.state {
                WorkerState::Starting | WorkerState::Running | WorkerState::Stopping => shared.pid,
                _ => None,
            }
        };
        let Some(pid) = pid else {
            return Ok(());
        };
        signals::send_signal(pid, signal).map_err(|error| SuperviseError::SignalFailed {
            program: self.program.clone(),
            index: self.index,
            message: error.to_string(),
        })
    }

    async fn supervise(
        self: Arc<Self>,
        mut child: Child,
        mut spec: Arc<ProgramSpec>,
        token: CancellationToken,
    ) {
        loop {
            // A stop may have raced this spawn before the pid was recorded;
            // deliver the kill it could not. The exit is reaped below and
            // settles the slot in Stopped.
            let stop_raced = self.shared.lock().stop_requested;
            if stop_raced {
                let _ = child.start_kill();
            }

            // Start-confirmation window. The timer branch is polled first,
            // so a child alive at exactly the boundary counts as Running.
            let confirm = sleep(spec.start_window());
            tokio::pin!(confirm);
            let mut awaiting_confirmation = true;
            let status = loop {
                tokio::select! {
                    biased;
                    _ = &mut confirm, if awaiting_confirmation => {
                        awaiting_confirmation = false;
                        let mut shared = self.shared.lock();
                        if shared.state == WorkerState::Starting {
                            shared.restart_count = 0;
                            self.transition(&mut shared, WorkerState::Running);
                            drop(shared);
                            self.log.info(format!("{}: running", self.tag()));
                        }
                    }
                    status = child.wait() => break status,
                }
            };

            match self.react_to_exit(status, &spec) {
                Reaction::Idle => return,
                Reaction::Backoff(delay) => {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = token.cancelled() => {
                            let mut shared = self.shared.lock();
                            shared.pid = None;
                            self.transition(&mut shared, WorkerState::Stopped);
                            return;
                        }
                    }

                    // Policy-level fields may have changed under us; each
                    // spawn uses the spec in force.
                    spec = self.spec.get();
                    match self.spawn_child(&spec).await {
                        Ok(new_child) => {
                            {
                                let mut shared = self.shared.lock();
                                self.transition(&mut shared, WorkerState::Starting);
                            }
                            self.record_spawn(&new_child);
                            self.log.info(format!(
                                "{}: respawned pid {} (attempt {})",
                                self.tag(),
                                new_child.id().unwrap_or_default(),
                                self.shared.lock().restart_count
                            ));
                            child = new_child;
                        }
                        Err(error) => {
                            {
                                let mut shared = self.shared.lock();
                                shared.pid = None;
                                self.transition(&mut shared, WorkerState::Fatal);
                            }
                            self.log
                                .error(format!("{}: respawn failed: {error}", self.tag()));
                            return;
                        }
                    }
                }
            }
        }
    }

    fn react_to_exit(&self, status: io::Result<std::process::ExitStatus>, spec: &ProgramSpec) -> Reaction {
        let code = status.as_ref().ok().and_then(|s| s.code());
        let detail = describe_exit(&status);

        let mut shared = self.shared.lock();
        shared.pid = None;

        if shared.stop_requested || shared.state == WorkerState::Stopping {
            self.transition(&mut shared, WorkerState::Stopped);
            drop(shared);
            self.log.info(format!("{}: stopped ({detail})", self.tag()));
            return Reaction::Idle;
        }

        let expected = spec.expects_exit_code(code);
        if spec.restart_policy.should_restart(expected) {
            if shared.restart_count < spec.start_retries {
                shared.restart_count += 1;
                let attempt = shared.restart_count;
                let delay = backoff_delay(attempt);
                self.transition(&mut shared, WorkerState::Backoff);
                drop(shared);
                self.log.warning(format!(
                    "{}: {detail}; retrying in {}s (attempt {attempt}/{})",
                    self.tag(),
                    delay.as_secs(),
                    spec.start_retries
                ));
                Reaction::Backoff(delay)
            } else {
                self.transition(&mut shared, WorkerState::Fatal);
                drop(shared);
                self.log.error(format!(
                    "{}: {detail}; giving up after {} retries",
                    self.tag(),
                    spec.start_retries
                ));
                Reaction::Idle
            }
        } else {
            self.transition(&mut shared, WorkerState::Stopped);
            drop(shared);
            self.log.info(format!("{}: {detail}", self.tag()));
            Reaction::Idle
        }
    }

    async fn spawn_child(&self, spec: &ProgramSpec) -> io::Result<Child> {
        let mut parts = spec.command.split_whitespace();
        let executable = parts.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty command")
        })?;

        let mut command = Command::new(executable);
        command.args(parts);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        // The child inherits the daemon environment; the spec's map is
        // layered on top.
        command.envs(&spec.env);
        #[cfg(unix)]
        if let Some(mask) = spec.umask {
            unsafe {
                command.pre_exec(move || {
                    libc::umask(mask as libc::mode_t);
                    Ok(())
                });
            }
        }

        let mut child = command.spawn()?;

        let sinks = outputs::open_sinks(spec, self.index, &self.log).await;
        if let Some(stdout) = child.stdout.take() {
            outputs::pump_stream(
                &self.program,
                self.index,
                "stdout",
                stdout,
                sinks.stdout,
                self.log.clone(),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            outputs::pump_stream(
                &self.program,
                self.index,
                "stderr",
                stderr,
                sinks.stderr,
                self.log.clone(),
            );
        }

        Ok(child)
    }

    fn record_spawn(&self, child: &Child) {
        let mut shared = self.shared.lock();
        shared.pid = child.id();
        shared.started_at = Some(Instant::now());
        shared.started_at_wall = Some(SystemTime::now());
    }

    fn fresh_run_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.run_token.lock() = token.clone();
        token
    }

    fn transition(&self, shared: &mut WorkerShared, next: WorkerState) {
        shared.state = next;
        let _ = self.state_tx.send(next);
    }

    async fn wait_idle(&self, limit: Duration) {
        if !self.try_wait_idle(limit).await {
            tracing::warn!(worker = %self.tag(), "worker did not settle within {:?}", limit);
        }
    }

    async fn try_wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let result = timeout(limit, rx.wait_for(|state| state.is_idle())).await;
        result.is_ok()
    }

    fn tag(&self) -> String {
        format!("{}:{}", self.program, self.index)
    }
}

fn backoff_delay(restart_count: u32) -> Duration {
    let exponent = restart_count.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exponent).min(BACKOFF_CAP_SECS))
}

fn describe_exit(status: &io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                format!("exited with code {code}")
            } else if let Some(signal) = exit_signal(status) {
                format!("terminated by signal {signal}")
            } else {
                "exited".to_string()
            }
        }
        Err(error) => format!("wait failed: {error}"),
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }

    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}
