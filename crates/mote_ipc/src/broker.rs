use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    io::{split, AsyncReadExt, AsyncWriteExt, WriteHalf},
    sync::Mutex,
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::{encode_frame, FrameReader},
    message::{decode_register, IpcMessage, MessageKind, Role},
    transport::{self, ServerStream},
    IpcError,
};

const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const READ_IDLE: Duration = Duration::from_secs(30);

/// Handler invoked on the dispatch path for a given message kind.
///
/// Handlers run in registration order and must not block.
pub type Handler = Arc<dyn Fn(&IpcMessage) + Send + Sync>;

/// Callback invoked when a registered client's connection is removed.
pub type DisconnectHandler = Arc<dyn Fn(Role) + Send + Sync>;

struct Client {
    role: Role,
    pid: u32,
    writer: Mutex<WriteHalf<ServerStream>>,
    closed: CancellationToken,
}

impl Client {
    async fn write_frame(&self, frame: &[u8]) -> Result<(), IpcError> {
        let mut writer = self.writer.lock().await;
        match time::timeout(WRITE_DEADLINE, writer.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(IpcError::Write(source)),
            Err(_) => Err(IpcError::WriteTimeout(WRITE_DEADLINE)),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

struct Shared {
    clients: Mutex<HashMap<Role, Arc<Client>>>,
    handlers: Mutex<HashMap<MessageKind, Vec<Handler>>>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    read_idle: Duration,
    shutdown: CancellationToken,
}

/// Local IPC server running in the main process.
///
/// Accepts helper connections over the platform transport, associates each
/// with a [`Role`] once it registers, routes typed messages to per-kind
/// handlers, and delivers targeted sends and broadcasts.
pub struct Broker {
    endpoint: String,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Creates a broker bound to `endpoint` once [`Broker::start`] is called.
    ///
    /// Tests inject a throwaway path here; production uses
    /// [`transport::DEFAULT_ENDPOINT`].
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_read_idle(endpoint, READ_IDLE)
    }

    /// Creates a broker with a custom heartbeat idle interval.
    pub fn with_read_idle(endpoint: impl Into<String>, read_idle: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            shared: Arc::new(Shared {
                clients: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                on_disconnect: Mutex::new(None),
                read_idle,
                shutdown: CancellationToken::new(),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// The transport endpoint this broker binds.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Binds the transport and enters the accept loop on a background task.
    pub async fn start(&self) -> Result<(), IpcError> {
        let mut listener = transport::bind(&self.endpoint)?;
        info!(endpoint = %self.endpoint, "ipc broker listening");

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => {
                            let shared = shared.clone();
                            tokio::spawn(serve_connection(shared, stream));
                        }
                        Err(error) => {
                            if shared.shutdown.is_cancelled() {
                                break;
                            }
                            warn!(error = %error, "accept failed");
                            time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            listener.cleanup();
        });

        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    /// Cancels all loops, closes every client, and unlinks the socket.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();

        let clients: Vec<Arc<Client>> = {
            let mut table = self.shared.clients.lock().await;
            table.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close().await;
        }

        if let Some(handle) = self.accept_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Appends a handler for a message kind.
    pub async fn register_handler(
        &self,
        kind: MessageKind,
        handler: impl Fn(&IpcMessage) + Send + Sync + 'static,
    ) {
        let mut handlers = self.shared.handlers.lock().await;
        handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Installs the callback invoked when a registered client disconnects.
    pub async fn set_disconnect_handler(&self, handler: impl Fn(Role) + Send + Sync + 'static) {
        *self.shared.on_disconnect.lock().await = Some(Arc::new(handler));
    }

    /// Delivers a message to the uniquely-connected client for `role`.
    pub async fn send(&self, role: Role, message: &IpcMessage) -> Result<(), IpcError> {
        send_to_role(&self.shared, role, message).await
    }

    /// Delivers a message to every connected client, best-effort.
    ///
    /// Per-client failures are logged and the first one is reported.
    pub async fn broadcast(&self, message: &IpcMessage) -> Result<(), IpcError> {
        let clients: Vec<Arc<Client>> = {
            let table = self.shared.clients.lock().await;
            table.values().cloned().collect()
        };
        let frame = encode_frame(message)?;

        let mut first_failure = None;
        for client in clients {
            if let Err(error) = client.write_frame(&frame).await {
                warn!(role = %client.role, error = %error, "broadcast delivery failed");
                remove_if_current(&self.shared, &client).await;
                client.close().await;
                if first_failure.is_none() {
                    first_failure = Some(error);
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Whether a client is currently registered for `role`.
    pub async fn is_connected(&self, role: Role) -> bool {
        self.shared.clients.lock().await.contains_key(&role)
    }

    /// Roles with a live registered connection.
    pub async fn connected_roles(&self) -> Vec<Role> {
        self.shared.clients.lock().await.keys().copied().collect()
    }

    /// Pid the client for `role` reported at registration.
    pub async fn client_pid(&self, role: Role) -> Option<u32> {
        self.shared
            .clients
            .lock()
            .await
            .get(&role)
            .map(|client| client.pid)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Ok(mut guard) = self.accept_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

async fn send_to_role(shared: &Shared, role: Role, message: &IpcMessage) -> Result<(), IpcError> {
    let client = {
        let table = shared.clients.lock().await;
        table.get(&role).cloned()
    }
    .ok_or(IpcError::RoleNotConnected(role))?;

    let frame = encode_frame(message)?;
    match client.write_frame(&frame).await {
        Ok(()) => Ok(()),
        Err(error) => {
            remove_if_current(shared, &client).await;
            client.close().await;
            Err(error)
        }
    }
}

async fn serve_connection(shared: Arc<Shared>, stream: ServerStream) {
    let (mut reader, writer) = split(stream);
    // Incremental decoding with plain `read` keeps the idle timeout from
    // discarding a partially received frame: a timed-out `read` has
    // consumed nothing.
    let mut frames = FrameReader::new();
    let mut chunk = [0u8; 4096];

    // Registration phase: the first frame must be `register`.
    let first = loop {
        match frames.next_message() {
            Ok(Some(message)) => break message,
            Ok(None) => {}
            Err(error) => {
                warn!(error = %error, "frame error before registration, closing");
                return;
            }
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            read = time::timeout(shared.read_idle, reader.read(&mut chunk)) => match read {
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => frames.push(&chunk[..n]),
                Ok(Err(error)) => {
                    debug!(error = %error, "connection dropped before registration");
                    return;
                }
                Err(_) => {
                    debug!("connection idle before registration, closing");
                    return;
                }
            }
        }
    };
    if first.kind != MessageKind::Register {
        warn!(kind = %first.kind, "first frame was not register, closing");
        return;
    }
    let registration = match decode_register(&first) {
        Ok(registration) => registration,
        Err(error) => {
            warn!(error = %error, "malformed register payload, closing");
            return;
        }
    };

    let client = Arc::new(Client {
        role: registration.role,
        pid: registration.pid,
        writer: Mutex::new(writer),
        closed: CancellationToken::new(),
    });
    install(&shared, client.clone()).await;
    info!(role = %registration.role, pid = registration.pid, "client registered");

    // Registration handlers (e.g. supervisor readiness wiring) see the
    // register message like any other kind.
    dispatch(&shared, &client, &first).await;

    loop {
        match frames.next_message() {
            Ok(Some(message)) => {
                dispatch(&shared, &client, &message).await;
                continue;
            }
            Ok(None) => {}
            Err(error) => {
                debug!(role = %client.role, error = %error, "frame error, closing");
                break;
            }
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            // Evicted by a newer registrant: the table entry now belongs to
            // the newcomer, so exit without touching it.
            _ = client.closed.cancelled() => return,
            read = time::timeout(shared.read_idle, reader.read(&mut chunk)) => match read {
                Err(_) => {
                    let ping = IpcMessage::to(MessageKind::Ping, Role::Main, client.role);
                    let frame = match encode_frame(&ping) {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    if client.write_frame(&frame).await.is_err() {
                        debug!(role = %client.role, "heartbeat write failed, closing");
                        break;
                    }
                }
                Ok(Ok(0)) => {
                    debug!(role = %client.role, "connection closed by peer");
                    break;
                }
                Ok(Ok(n)) => frames.push(&chunk[..n]),
                Ok(Err(error)) => {
                    debug!(role = %client.role, error = %error, "read failed, closing");
                    break;
                }
            }
        }
    }

    remove_if_current(&shared, &client).await;
    client.close().await;
}

async fn install(shared: &Arc<Shared>, client: Arc<Client>) {
    let prior = {
        let mut table = shared.clients.lock().await;
        table.insert(client.role, client.clone())
    };
    if let Some(prior) = prior {
        info!(role = %client.role, evicted_pid = prior.pid, "evicting previous client for role");
        prior.close().await;
    }
}

async fn dispatch(shared: &Arc<Shared>, client: &Arc<Client>, message: &IpcMessage) {
    match message.kind {
        MessageKind::Ping => {
            let pong = IpcMessage::to(MessageKind::Pong, Role::Main, client.role)
                .in_reply_to(message.id.clone());
            if let Ok(frame) = encode_frame(&pong) {
                let _ = client.write_frame(&frame).await;
            }
        }
        MessageKind::Pong => {
            debug!(role = %client.role, "pong received");
        }
        _ => {}
    }

    let handlers = {
        let table = shared.handlers.lock().await;
        table.get(&message.kind).cloned().unwrap_or_default()
    };
    for handler in &handlers {
        handler(message);
    }

    // Helper-to-helper traffic is relayed; main-addressed messages are
    // consumed by the handlers above.
    if let Some(target) = message.target {
        if target != Role::Main && target != client.role {
            if let Err(error) = send_to_role(shared, target, message).await {
                debug!(target = %target, error = %error, "relay failed");
            }
        }
    }
}

async fn remove_if_current(shared: &Shared, client: &Arc<Client>) {
    let removed = {
        let mut table = shared.clients.lock().await;
        match table.get(&client.role) {
            Some(current) if Arc::ptr_eq(current, client) => {
                table.remove(&client.role);
                true
            }
            _ => false,
        }
    };
    if removed {
        let callback = shared.on_disconnect.lock().await.clone();
        if let Some(callback) = callback {
            callback(client.role);
        }
    }
}
