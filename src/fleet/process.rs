//! Worker process lifecycle
//!
//! Spawns one OS process per [`WorkerSpec`], funnels every exit into a single
//! death channel and owns the write end of the parent-death pipe. Workers
//! inherit the read end as fd [`PARENT_PIPE_FD`]; when the write end closes,
//! whether deliberately or because this process died, their read returns EOF.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, PipeReader, PipeWriter};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{TrafficKind, WorkerIdentity, WorkerSpec};
use crate::errors::{FleetError, Result};

/// Descriptor number the parent-death pipe is inherited as
pub const PARENT_PIPE_FD: RawFd = 3;

/// Environment variable telling a worker which descriptor to watch
pub const PARENT_PIPE_ENV: &str = "HYDRA_PARENT_PIPE_FD";

/// Environment variable carrying the supervisor's run id to workers
pub const RUN_ID_ENV: &str = "HYDRA_RUN_ID";

/// Lifecycle of a single worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Running,
    Registered,
    Terminated,
}

impl WorkerState {
    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Spawning, Running) | (Running, Registered) | (Running, Terminated) | (Registered, Terminated)
        )
    }
}

/// Program and leading arguments used to start a worker.
///
/// Defaults to re-executing the current binary with the hidden
/// `serve-backend` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub base_args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, base_args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self { program: program.into(), base_args: base_args.into_iter().map(Into::into).collect() }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| FleetError::config(format!("cannot locate current executable: {}", e)))?;
        Ok(Self::new(program, ["serve-backend"]))
    }
}

/// Per-run settings every worker is started with
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub metadata_url: String,
    pub listen_address: String,
    pub cert_dir: PathBuf,
    pub run_id: String,
}

impl WorkerLaunch {
    fn args(&self, spec: &WorkerSpec) -> Vec<OsString> {
        vec![
            "--name".into(),
            spec.name.as_str().into(),
            "--traffic-type".into(),
            spec.traffic_type.as_str().into(),
            "--listen-address".into(),
            self.listen_address.clone().into(),
            "--metadata-url".into(),
            self.metadata_url.clone().into(),
            "--cert-dir".into(),
            self.cert_dir.clone().into_os_string(),
        ]
    }
}

/// A worker process exit observed by its wait task
#[derive(Debug)]
pub struct WorkerExit {
    pub worker: WorkerIdentity,
    pub traffic_type: TrafficKind,
    pub status: io::Result<ExitStatus>,
}

#[derive(Debug)]
struct Tracked {
    pid: Option<u32>,
    state: WorkerState,
}

/// The set of worker processes spawned for one run
pub struct WorkerProcesses {
    command: WorkerCommand,
    pipe_reader: Option<PipeReader>,
    pipe_writer: Option<PipeWriter>,
    exits_tx: mpsc::UnboundedSender<WorkerExit>,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
    workers: HashMap<WorkerIdentity, Tracked>,
}

impl WorkerProcesses {
    pub fn new(command: WorkerCommand) -> Result<Self> {
        let (pipe_reader, pipe_writer) = io::pipe()?;
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Ok(Self {
            command,
            pipe_reader: Some(pipe_reader),
            pipe_writer: Some(pipe_writer),
            exits_tx,
            exits_rx,
            workers: HashMap::new(),
        })
    }

    /// Start the process for `spec`. Any failure is fatal to the run.
    pub fn spawn(&mut self, spec: &WorkerSpec, launch: &WorkerLaunch) -> Result<u32> {
        let reader = self.pipe_reader.as_ref().ok_or_else(|| FleetError::Spawn {
            worker: spec.name.to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "parent pipe already released"),
        })?;
        let read_fd = reader.as_raw_fd();

        self.workers.insert(spec.name.clone(), Tracked { pid: None, state: WorkerState::Spawning });

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.base_args)
            .args(launch.args(spec))
            .env(PARENT_PIPE_ENV, PARENT_PIPE_FD.to_string())
            .env(RUN_ID_ENV, &launch.run_id)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || inherit_as_parent_pipe(read_fd));
        }

        let mut child = cmd.spawn().map_err(|source| {
            self.workers.remove(&spec.name);
            FleetError::Spawn { worker: spec.name.to_string(), source }
        })?;

        let pid = child.id();
        let tracked = self.tracked_mut(&spec.name)?;
        tracked.pid = pid;
        advance(&spec.name, tracked, WorkerState::Running);

        debug!(worker = %spec.name, traffic_type = %spec.traffic_type, pid = ?pid, "Spawned backend");

        let tx = self.exits_tx.clone();
        let worker = spec.name.clone();
        let traffic_type = spec.traffic_type;
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = tx.send(WorkerExit { worker, traffic_type, status });
        });

        pid.ok_or_else(|| FleetError::internal(format!("{} exited before its pid was read", spec.name)))
    }

    fn tracked_mut(&mut self, worker: &WorkerIdentity) -> Result<&mut Tracked> {
        self.workers.get_mut(worker).ok_or_else(|| FleetError::internal(format!("{} is not tracked", worker)))
    }

    /// Next worker exit, in the order the kernel reported them
    pub async fn next_exit(&mut self) -> Option<WorkerExit> {
        let exit = self.exits_rx.recv().await?;
        if let Some(tracked) = self.workers.get_mut(&exit.worker) {
            advance(&exit.worker, tracked, WorkerState::Terminated);
        }
        Some(exit)
    }

    /// Record that `worker` has been accepted by the registration barrier
    pub fn mark_registered(&mut self, worker: &WorkerIdentity) {
        if let Some(tracked) = self.workers.get_mut(worker) {
            advance(worker, tracked, WorkerState::Registered);
        }
    }

    pub fn state(&self, worker: &WorkerIdentity) -> Option<WorkerState> {
        self.workers.get(worker).map(|t| t.state)
    }

    pub fn pid(&self, worker: &WorkerIdentity) -> Option<u32> {
        self.workers.get(worker).and_then(|t| t.pid)
    }

    /// Number of workers not yet observed as terminated
    pub fn live(&self) -> usize {
        self.workers.values().filter(|t| t.state != WorkerState::Terminated).count()
    }

    /// Close the pipe write end, telling every worker to stop
    pub fn release(&mut self) {
        self.pipe_reader.take();
        if self.pipe_writer.take().is_some() {
            info!(live = self.live(), "Released parent pipe; backends will stop");
        }
    }

    /// Release the pipe and reap workers until all have exited or `grace` elapses.
    /// Returns how many were still alive at the deadline.
    pub async fn shutdown(&mut self, grace: Duration) -> usize {
        self.release();

        let deadline = tokio::time::Instant::now() + grace;
        while self.live() > 0 {
            match tokio::time::timeout_at(deadline, self.next_exit()).await {
                Ok(Some(exit)) => debug!(worker = %exit.worker, status = ?exit.status, "Backend stopped"),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.live(), "Backends still running after shutdown grace period");
                    break;
                }
            }
        }
        self.live()
    }
}

fn advance(worker: &WorkerIdentity, tracked: &mut Tracked, next: WorkerState) {
    if tracked.state.can_transition_to(next) {
        tracked.state = next;
    } else {
        debug!(worker = %worker, from = ?tracked.state, to = ?next, "Ignoring worker state transition");
    }
}

/// Runs in the forked child before exec.
fn inherit_as_parent_pipe(read_fd: RawFd) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on a descriptor owned by the parent.
    unsafe {
        if read_fd == PARENT_PIPE_FD {
            let flags = libc::fcntl(read_fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(read_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(read_fd, PARENT_PIPE_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Take ownership of the inherited parent-death pipe named by
/// [`PARENT_PIPE_ENV`]. Returns `None` when the process was not started by a
/// supervisor.
pub fn inherited_parent_pipe() -> Result<Option<OwnedFd>> {
    let Ok(raw) = std::env::var(PARENT_PIPE_ENV) else {
        return Ok(None);
    };
    let fd: RawFd = raw
        .trim()
        .parse()
        .map_err(|_| FleetError::config(format!("{} is not a descriptor: {}", PARENT_PIPE_ENV, raw)))?;

    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(FleetError::config(format!(
            "{}={} is not an open descriptor: {}",
            PARENT_PIPE_ENV,
            fd,
            io::Error::last_os_error()
        )));
    }

    // SAFETY: the descriptor is open and nothing else in this process owns it.
    Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Cancel `token` once the parent's write end of `pipe` closes.
///
/// The returned handle resolves to `true` if the parent went away and `false`
/// if the token was cancelled for another reason first.
pub fn watch_parent(pipe: OwnedFd, token: CancellationToken) -> Result<JoinHandle<bool>> {
    let mut receiver = pipe::Receiver::from_owned_fd(pipe)?;

    Ok(tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                res = receiver.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "Parent pipe read failed; treating parent as gone");
                        break;
                    }
                },
            }
        }
        warn!("Parent process went away; stopping");
        token.cancel();
        true
    }))
}

/// Cancel `token` on SIGTERM or SIGINT
pub async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut int)) = (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) else {
        warn!("Could not install signal handlers");
        return;
    };
    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}
