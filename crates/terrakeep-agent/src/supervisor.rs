use std::{
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use terrakeep_process::{
    ChatMessage, Player, QueueOccupancy, ServerId, ServerMetadata, ServerState, ServerStatus,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{Mutex, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    command_queue::{self, CommandQueue},
    config::{SupervisorConfig, Verbosity},
    correlator::{ConnectionCorrelator, CorrelatorHandle},
    dispatch::{self, DispatchContext},
    error::SupervisorError,
    events, players,
    state::ServerShared,
};

/// Informational commands issued once the server is ready, so that metadata
/// is populated early.
pub(crate) const BOOTSTRAP_COMMANDS: &[&str] = &["seed", "version", "password", "motd"];

/// Observable state of the OS process behind the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessPhase {
    NotStarted,
    Running,
    Exited(Option<i32>),
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, the server goes down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// One launched process and every task attached to it.
struct RunHandle {
    child: Child,
    pgid: Option<i32>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunHandle {
    async fn kill(&mut self) {
        if let Some(pgid) = self.pgid {
            #[cfg(unix)]
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "kill after group signal");
        }
    }

    /// Cancels and joins the reader, writer and correlator tasks.
    async fn join_tasks(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "server task ended abnormally");
            }
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReaderCtx {
    shared: Arc<ServerShared>,
    correlator: CorrelatorHandle,
    verbosity: Verbosity,
    state: Arc<watch::Sender<ServerState>>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
}

/// Reads server output line by line. Lines before the readiness sentinel are
/// only logged; afterwards each line is classified and dispatched.
async fn run_reader<R>(stdout: R, ctx: ReaderCtx)
where
    R: AsyncRead + Unpin,
{
    tracing::debug!("started server output reader");
    let ReaderCtx {
        shared,
        correlator,
        verbosity,
        state,
        ready,
        cancel,
    } = ctx;
    let mut ready = Some(ready);
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "reading server output failed");
                break;
            }
        }

        let raw = String::from_utf8_lossy(&buf).into_owned();
        buf.clear();
        let line = events::normalize_line(&raw);
        shared.record_console(line);

        if events::is_ready_sentinel(line) {
            match ready.take() {
                Some(tx) => {
                    tracing::info!("server init completed");
                    let _ = tx.send(());
                }
                None => tracing::debug!("ignoring repeated readiness line"),
            }
            continue;
        }

        if ready.is_some() {
            tracing::info!(target: "terrakeep::init", "{line}");
            continue;
        }

        let ctx = DispatchContext {
            shared: &shared,
            correlator: &correlator,
            verbosity,
        };
        dispatch::apply(&ctx, events::classify(line), line);
    }

    let expected = matches!(
        *state.borrow(),
        ServerState::Stopping | ServerState::Stopped
    );
    if !expected {
        tracing::warn!("server output closed unexpectedly");
        state.send_replace(ServerState::Failed);
        shared.queue.close();
        cancel.cancel();
    }
    tracing::debug!("server output reader stopped");
}

async fn run_stderr<R>(stderr: R, shared: Arc<ServerShared>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else {
            break;
        };
        tracing::warn!(target: "terrakeep::console", "[stderr] {line}");
        shared.record_console(format!("[stderr] {line}"));
    }
}

/// Supervises a single Terraria server process.
pub struct TerrariaServer {
    id: ServerId,
    config: SupervisorConfig,
    shared: Arc<ServerShared>,
    state: Arc<watch::Sender<ServerState>>,
    pid: AtomicU32,
    run: Mutex<Option<RunHandle>>,
}

impl TerrariaServer {
    pub fn new(config: SupervisorConfig) -> Self {
        let shared = Arc::new(ServerShared::new(
            config.max_commands,
            config.console_max_lines,
        ));
        let (state, _) = watch::channel(ServerState::Stopped);
        Self {
            id: ServerId::new(),
            config,
            shared,
            state: Arc::new(state),
            pid: AtomicU32::new(0),
            run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn verbosity(&self) -> Verbosity {
        self.config.verbosity
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn is_up(&self) -> bool {
        self.state().is_up()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn set_state(&self, state: ServerState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            tracing::debug!(server = %self.id, from = ?prev, to = ?state, "state change");
        }
    }

    /// Launches the server and waits for its readiness line.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut run = self.run.lock().await;
        self.start_locked(&mut run).await
    }

    /// Asks the server to exit, killing it if it does not within the stop
    /// timeout. Players are cleared and all tasks joined either way.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await
    }

    /// Stop then start, holding the lifecycle lock across both. A failed stop
    /// aborts the restart.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await?;
        self.start_locked(&mut run).await
    }

    async fn start_locked(&self, run: &mut Option<RunHandle>) -> Result<(), SupervisorError> {
        if let Some(mut old) = run.take() {
            // A failed run is replaced even if its process lingers, e.g. with
            // stdout closed or not yet reapable after a crash.
            let failed = self.state() == ServerState::Failed;
            match old.child.try_wait() {
                Ok(None) if !failed => {
                    *run = Some(old);
                    return Err(SupervisorError::AlreadyRunning);
                }
                Ok(None) => {
                    tracing::warn!(server = %self.id, "failed server still has a live process, killing");
                    old.kill().await;
                }
                Ok(Some(status)) => {
                    tracing::info!(server = %self.id, ?status, "reaping previous server run");
                }
                Err(e) => {
                    tracing::warn!(server = %self.id, error = %e, "previous server in unknown state, killing");
                    old.kill().await;
                }
            }
            old.join_tasks().await;
        }

        self.set_state(ServerState::Starting);
        match self.launch().await {
            Ok(handle) => {
                *run = Some(handle);
                // The reader may already have seen the process die.
                let promoted = self.state.send_if_modified(|s| {
                    let starting = *s == ServerState::Starting;
                    if starting {
                        *s = ServerState::Running;
                    }
                    starting
                });
                if !promoted {
                    tracing::warn!(server = %self.id, "server exited right after becoming ready");
                    return Ok(());
                }
                for cmd in BOOTSTRAP_COMMANDS {
                    if let Err(e) = self.shared.queue.enqueue(*cmd) {
                        tracing::debug!(server = %self.id, command = %cmd, error = %e, "bootstrap command not queued");
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.pid.store(0, Ordering::Release);
                self.shared.queue.close();
                self.set_state(ServerState::Failed);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<RunHandle, SupervisorError> {
        tracing::info!(
            server = %self.id,
            program = %self.config.program,
            args = ?self.config.args,
            "starting server"
        );

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            SupervisorError::Launch(format!("spawn {}: {e}", self.config.program))
        })?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(SupervisorError::Launch(
                "server stdio could not be acquired".to_string(),
            ));
        };
        let stderr = child.stderr.take();
        self.pid.store(pid.unwrap_or(0), Ordering::Release);

        let cancel = CancellationToken::new();
        let commands = self.shared.queue.reset();
        let (corr_tx, corr_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let mut tasks = Vec::with_capacity(4);
        tasks.push(tokio::spawn(run_reader(
            stdout,
            ReaderCtx {
                shared: self.shared.clone(),
                correlator: CorrelatorHandle::new(corr_tx),
                verbosity: self.config.verbosity,
                state: self.state.clone(),
                ready: ready_tx,
                cancel: cancel.clone(),
            },
        )));
        tasks.push(tokio::spawn(command_queue::run_writer(
            commands,
            stdin,
            self.config.command_delay,
            cancel.clone(),
        )));
        let correlator = ConnectionCorrelator::new(self.config.correlator);
        let correlator_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            correlator.run(corr_rx, correlator_cancel).await;
        }));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(run_stderr(
                stderr,
                self.shared.clone(),
                cancel.clone(),
            )));
        }

        let mut handle = RunHandle {
            child,
            pgid,
            cancel,
            tasks,
        };

        let failure = match tokio::time::timeout(self.config.ready_timeout, ready_rx).await {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some("server exited before it was ready".to_string()),
            Err(_) => Some(format!(
                "no readiness line within {}s",
                self.config.ready_timeout.as_secs()
            )),
        };
        if let Some(reason) = failure {
            tracing::error!(server = %self.id, %reason, "server failed to start");
            handle.kill().await;
            handle.join_tasks().await;
            return Err(SupervisorError::NotReady(reason));
        }

        tracing::info!(server = %self.id, pid = ?pid, "server is up");
        Ok(handle)
    }

    async fn stop_locked(&self, run: &mut Option<RunHandle>) -> Result<(), SupervisorError> {
        let Some(mut handle) = run.take() else {
            return Err(SupervisorError::NotRunning);
        };

        tracing::info!(server = %self.id, "stopping server");
        self.set_state(ServerState::Stopping);
        if let Err(e) = self.shared.queue.shutdown("exit") {
            tracing::debug!(server = %self.id, error = %e, "exit command not delivered");
        }

        let timeout = self.config.stop_timeout;
        tracing::debug!(server = %self.id, timeout_ms = timeout.as_millis() as u64, "waiting for server to exit");
        let result = match tokio::time::timeout(timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.id, ?status, "server has been stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                handle.kill().await;
                Err(SupervisorError::UnknownProcessState(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(server = %self.id, "server took too long to exit, killing");
                handle.kill().await;
                Err(SupervisorError::ShutdownTimeout(timeout))
            }
        };

        handle.join_tasks().await;
        self.shared.queue.close();
        self.shared.players.clear();
        self.pid.store(0, Ordering::Release);
        self.set_state(ServerState::Stopped);
        result
    }

    /// Polls the OS process without blocking on it.
    pub async fn process_phase(&self) -> Result<ProcessPhase, SupervisorError> {
        let mut run = self.run.lock().await;
        let Some(handle) = run.as_mut() else {
            return Ok(ProcessPhase::NotStarted);
        };
        match handle.child.try_wait() {
            Ok(None) => Ok(ProcessPhase::Running),
            Ok(Some(status)) => Ok(ProcessPhase::Exited(status.code())),
            Err(e) => Err(SupervisorError::UnknownProcessState(e.to_string())),
        }
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            id: self.id.clone(),
            state: self.state(),
            pid: self.pid(),
            players: u32::try_from(self.shared.players.len()).unwrap_or(u32::MAX),
            queue: self.queue_occupancy(),
        }
    }

    /// Queues a raw console command. Capacity problems are logged and
    /// reported but never fatal.
    pub fn enqueue(&self, cmd: impl Into<String>) -> Result<(), SupervisorError> {
        self.shared.queue.enqueue(cmd)
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.shared.queue
    }

    pub fn queue_occupancy(&self) -> QueueOccupancy {
        self.shared.queue.occupancy()
    }

    pub fn players(&self) -> Vec<Player> {
        self.shared.players.list()
    }

    pub fn player(&self, name: &str) -> Option<Player> {
        self.shared.players.get(name)
    }

    /// Returns whether the player was known. Kicking itself is optimistic.
    pub fn kick(&self, name: &str, reason: &str) -> bool {
        let Some(p) = self.player(name) else {
            return false;
        };
        players::kick(&self.shared.queue, &p, reason);
        true
    }

    pub fn ban(&self, name: &str, reason: &str) -> bool {
        let Some(p) = self.player(name) else {
            return false;
        };
        players::ban(&self.shared.queue, &p, reason);
        true
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        self.shared.chat()
    }

    pub fn metadata(&self) -> ServerMetadata {
        self.shared.metadata()
    }

    pub fn seed(&self) -> Option<String> {
        self.shared.metadata().seed
    }

    pub fn version(&self) -> Option<String> {
        self.shared.metadata().version
    }

    pub fn password(&self) -> Option<String> {
        self.shared.metadata().password
    }

    pub fn motd(&self) -> Option<String> {
        self.shared.metadata().motd
    }

    pub fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.shared.tail_console(cursor, limit)
    }
}
