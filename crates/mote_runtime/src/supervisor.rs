use std::{
    collections::HashMap,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::{mpsc, oneshot, watch, Mutex},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mote_ipc::{decode_register, transport, Broker, IpcMessage, MessageKind, Role};

use crate::RuntimeError;

const STOP_GRACE: Duration = Duration::from_secs(5);
const EXIT_BROADCAST_GRACE: Duration = Duration::from_millis(500);

/// Launch parameters for a supervised subprocess.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Stable name the process is tracked under.
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Role the child will claim when it registers over IPC.
    pub role: Role,
    /// Crash restarts before the supervisor gives up.
    pub max_restarts: u32,
    pub restart_delay: Duration,
    /// How long to wait for IPC registration; zero skips the wait.
    pub start_timeout: Duration,
    /// Hide the console window on Windows.
    pub hidden: bool,
}

/// Status snapshot for one supervised process.
#[derive(Clone, Debug)]
pub struct ProcessStatus {
    pub name: String,
    pub role: Role,
    pub running: bool,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_start_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct ProcessState {
    running: bool,
    pid: Option<u32>,
    restart_count: u32,
    last_start_ms: Option<u64>,
    kill_tx: Option<mpsc::UnboundedSender<()>>,
    running_rx: Option<watch::Receiver<bool>>,
}

struct ProcessEntry {
    config: ProcessConfig,
    state: Mutex<ProcessState>,
    registered_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_tx: mpsc::UnboundedSender<std::io::Result<ExitStatus>>,
    /// Set while the process is intentionally stopped; suppresses restarts.
    halted: AtomicBool,
}

/// Launches, monitors, and restarts helper subprocesses.
///
/// Holds a non-owning handle to the [`Broker`] so each child's IPC
/// registration can be wired into start readiness.
pub struct Supervisor {
    broker: Arc<Broker>,
    processes: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Creates the supervisor and installs its `register` handler on the
    /// broker.
    pub async fn new(broker: Arc<Broker>) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            broker: broker.clone(),
            processes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&supervisor);
        broker
            .register_handler(MessageKind::Register, move |message| {
                let Some(supervisor) = weak.upgrade() else {
                    return;
                };
                let registration = match decode_register(message) {
                    Ok(registration) => registration,
                    Err(error) => {
                        warn!(error = %error, "unreadable register payload");
                        return;
                    }
                };
                tokio::spawn(async move {
                    supervisor.mark_registered(registration.role).await;
                });
            })
            .await;

        supervisor
    }

    /// Spawns a new supervised process.
    ///
    /// Fails if a process with the same name already exists. When the
    /// config carries a positive start timeout, this blocks until the
    /// child registers with the broker, the timeout elapses (logged, not
    /// fatal), or the child exits first.
    pub async fn start(self: &Arc<Self>, config: ProcessConfig) -> Result<(), RuntimeError> {
        let (entry, exit_rx) = {
            let mut table = self.processes.lock().await;
            if table.contains_key(&config.name) {
                return Err(RuntimeError::AlreadyExists(config.name));
            }
            let (exit_tx, exit_rx) = mpsc::unbounded_channel();
            let entry = Arc::new(ProcessEntry {
                config,
                state: Mutex::new(ProcessState::default()),
                registered_tx: Mutex::new(None),
                exit_tx,
                halted: AtomicBool::new(false),
            });
            table.insert(entry.config.name.clone(), entry.clone());
            (entry, exit_rx)
        };

        if let Err(error) = self.spawn_child(&entry).await {
            self.processes.lock().await.remove(&entry.config.name);
            return Err(error);
        }

        let supervisor = self.clone();
        let loop_entry = entry.clone();
        tokio::spawn(async move {
            supervisor.supervise(loop_entry, exit_rx).await;
        });

        Ok(())
    }

    /// Requests a graceful stop, force-killing after five seconds.
    pub async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        entry.halted.store(true, Ordering::SeqCst);

        let (running, pid, kill_tx, running_rx) = {
            let state = entry.state.lock().await;
            (
                state.running,
                state.pid,
                state.kill_tx.clone(),
                state.running_rx.clone(),
            )
        };
        if !running {
            return Ok(());
        }

        interrupt(pid, kill_tx.as_ref());

        let Some(mut running_rx) = running_rx else {
            return Ok(());
        };
        if time::timeout(STOP_GRACE, running_rx.wait_for(|running| !running))
            .await
            .is_err()
        {
            warn!(process = %name, "did not exit within grace period, force-killing");
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            let _ = time::timeout(Duration::from_secs(2), running_rx.wait_for(|running| !running))
                .await;
        }
        Ok(())
    }

    /// Broadcasts an `exit` message, lets children unwind briefly, then
    /// stops every process and cancels the supervise loops.
    pub async fn stop_all(&self) {
        let exit = IpcMessage::new(MessageKind::Exit, Role::Main);
        if let Err(error) = self.broker.broadcast(&exit).await {
            debug!(error = %error, "exit broadcast incomplete");
        }
        time::sleep(EXIT_BROADCAST_GRACE).await;

        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(error) = self.stop(&name).await {
                warn!(process = %name, error = %error, "stop failed during shutdown");
            }
        }

        self.shutdown.cancel();
        self.processes.lock().await.clear();
    }

    /// Stops and relaunches a process, ignoring stop failures.
    pub async fn restart(&self, name: &str) -> Result<(), RuntimeError> {
        let entry = self
            .entry(name)
            .await
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        if let Err(error) = self.stop(name).await {
            debug!(process = %name, error = %error, "ignoring stop failure on restart");
        }
        {
            let mut state = entry.state.lock().await;
            state.restart_count = 0;
        }
        let result = self.spawn_child(&entry).await;
        entry.halted.store(false, Ordering::SeqCst);
        result
    }

    /// Whether the named process is currently alive.
    pub async fn is_running(&self, name: &str) -> bool {
        match self.entry(name).await {
            Some(entry) => entry.state.lock().await.running,
            None => false,
        }
    }

    /// Crash restarts performed so far for the named process.
    pub async fn restart_count(&self, name: &str) -> Option<u32> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        Some(state.restart_count)
    }

    /// Snapshot of one process's supervision state.
    pub async fn status(&self, name: &str) -> Option<ProcessStatus> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        Some(ProcessStatus {
            name: entry.config.name.clone(),
            role: entry.config.role,
            running: state.running,
            pid: state.pid,
            restart_count: state.restart_count,
            last_start_ms: state.last_start_ms,
        })
    }

    /// Pid of the named process, when alive.
    pub async fn pid(&self, name: &str) -> Option<u32> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        state.pid
    }

    async fn entry(&self, name: &str) -> Option<Arc<ProcessEntry>> {
        self.processes.lock().await.get(name).cloned()
    }

    async fn mark_registered(&self, role: Role) {
        let entry = {
            let table = self.processes.lock().await;
            table
                .values()
                .find(|entry| entry.config.role == role)
                .cloned()
        };
        let Some(entry) = entry else {
            return;
        };
        let taken = entry.registered_tx.lock().await.take();
        if let Some(tx) = taken {
            let _ = tx.send(());
        }
    }

    async fn supervise(
        self: Arc<Self>,
        entry: Arc<ProcessEntry>,
        mut exit_rx: mpsc::UnboundedReceiver<std::io::Result<ExitStatus>>,
    ) {
        loop {
            let exited = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                exited = exit_rx.recv() => exited,
            };
            let Some(exited) = exited else {
                break;
            };
            match &exited {
                Ok(status) => {
                    info!(process = %entry.config.name, status = ?status, "process exited")
                }
                Err(error) => {
                    warn!(process = %entry.config.name, error = %error, "wait failed")
                }
            }

            if entry.halted.load(Ordering::SeqCst) {
                continue;
            }
            // A stale exit event from before a manual restart.
            if entry.state.lock().await.running {
                continue;
            }

            let count = entry.state.lock().await.restart_count;
            if count >= entry.config.max_restarts {
                warn!(
                    process = %entry.config.name,
                    restarts = count,
                    "restart cap reached, giving up"
                );
                continue;
            }
            {
                let mut state = entry.state.lock().await;
                state.restart_count += 1;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = time::sleep(entry.config.restart_delay) => {}
            }

            if let Err(error) = self.spawn_child(&entry).await {
                error!(process = %entry.config.name, error = %error, "respawn failed");
            }
        }
    }

    async fn spawn_child(&self, entry: &Arc<ProcessEntry>) -> Result<(), RuntimeError> {
        let config = &entry.config;
        let mut command = Command::new(&config.executable);
        command
            .args(&config.args)
            .env(transport::ENDPOINT_ENV, self.broker.endpoint())
            .env(transport::ROLE_ENV, config.role.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        #[cfg(windows)]
        if config.hidden {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let (registered_tx, registered_rx) = oneshot::channel();
        *entry.registered_tx.lock().await = Some(registered_tx);

        let mut child = command.spawn().map_err(|source| RuntimeError::Spawn {
            name: config.name.clone(),
            executable: config.executable.clone(),
            source,
        })?;
        let pid = child.id();
        info!(process = %config.name, pid = ?pid, "process started");

        if let Some(stdout) = child.stdout.take() {
            forward_output(config.name.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(config.name.clone(), "stderr", stderr);
        }

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(true);
        {
            let mut state = entry.state.lock().await;
            state.running = true;
            state.pid = pid;
            state.last_start_ms = Some(unix_millis());
            state.kill_tx = Some(kill_tx);
            state.running_rx = Some(running_rx.clone());
        }

        let exit_tx = entry.exit_tx.clone();
        let wait_entry = entry.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    exited = child.wait() => {
                        {
                            let mut state = wait_entry.state.lock().await;
                            state.running = false;
                            state.pid = None;
                            state.kill_tx = None;
                        }
                        let _ = running_tx.send(false);
                        let _ = exit_tx.send(exited);
                        break;
                    }
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            }
        });

        if config.start_timeout > Duration::ZERO {
            let mut running_rx = running_rx;
            tokio::select! {
                result = registered_rx => {
                    if result.is_ok() {
                        info!(process = %config.name, "child registered with broker");
                    }
                }
                _ = running_rx.wait_for(|running| !running) => {
                    return Err(RuntimeError::ExitedBeforeRegistration(config.name.clone()));
                }
                _ = time::sleep(config.start_timeout) => {
                    warn!(
                        process = %config.name,
                        timeout = ?config.start_timeout,
                        "child did not register before deadline, continuing"
                    );
                }
            }
        }

        Ok(())
    }
}

fn forward_output<R>(name: String, channel: &'static str, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = %name, channel, "{line}");
        }
    });
}

#[cfg(unix)]
fn interrupt(pid: Option<u32>, _kill_tx: Option<&mpsc::UnboundedSender<()>>) {
    use nix::{sys::signal, unistd::Pid};

    let Some(pid) = pid else {
        return;
    };
    if let Err(error) = signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGINT) {
        debug!(pid, error = %error, "interrupt failed");
    }
}

#[cfg(windows)]
fn interrupt(_pid: Option<u32>, kill_tx: Option<&mpsc::UnboundedSender<()>>) {
    if let Some(kill_tx) = kill_tx {
        let _ = kill_tx.send(());
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
