use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cli,
    mcp::{self, McpServerMap},
    protocol::{
        negotiated_protocol_version, parse_session_id, parse_stop_reason, ContentBlock, StopReason,
        CLIENT_PROTOCOL_VERSION, METHOD_HOOKS_INVOKE, METHOD_INITIALIZE,
        METHOD_PERMISSION_REQUEST, METHOD_PERMISSION_REQUEST_LEGACY,
        METHOD_PERMISSION_RESPONSE, METHOD_PERMISSION_RESPONSE_LEGACY, METHOD_SESSION_CREATE,
        METHOD_SESSION_CREATE_LEGACY, METHOD_SESSION_SEND, METHOD_SESSION_SEND_LEGACY,
        METHOD_TOOL_CALL,
    },
    tools, AgentError,
};

/// Default per-request deadline; prompts can legitimately run long.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const CANCEL_DRAIN_WINDOW: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Launch configuration for the copilot CLI.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub binary: PathBuf,
    pub model: Option<String>,
    pub add_dirs: Vec<PathBuf>,
    pub request_timeout: Duration,
}

impl ChannelConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model: None,
            add_dirs: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Future returned by the notification handler.
pub type NotificationFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// Handler for inbound notifications.
///
/// Awaited to completion on the reader task before the next line is read;
/// this ordering lets a permission response reach the remote before it
/// emits its next frame.
pub type NotificationHandler = Arc<dyn Fn(String, Value) -> NotificationFuture + Send + Sync>;
/// Handler for inbound `tool.call` requests.
pub type ToolCallHandler = Arc<dyn Fn(String, Value) -> tools::ToolFuture + Send + Sync>;
/// Future returned by the hooks handler.
pub type HooksFuture = Pin<Box<dyn Future<Output = Value> + Send>>;
/// Handler for inbound `hooks.invoke` requests.
pub type HooksHandler = Arc<dyn Fn(Value) -> HooksFuture + Send + Sync>;

/// Handler slots wired in at spawn time.
#[derive(Clone, Default)]
pub struct ChannelHandlers {
    pub notification: Option<NotificationHandler>,
    pub tool_call: Option<ToolCallHandler>,
    pub hooks: Option<HooksHandler>,
}

enum WriterMessage {
    Line(String),
    Shutdown,
}

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, AgentError>>>>>;

/// Bidirectional JSON-RPC 2.0 channel to the copilot CLI over stdio.
///
/// Framing is line-delimited JSON. Outgoing request ids are a monotonic
/// integer scoped to this channel; method names switch between dot and
/// slash notation based on the negotiated protocol version.
pub struct AcpChannel {
    writer: mpsc::UnboundedSender<WriterMessage>,
    pending: PendingRequests,
    next_id: AtomicU64,
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
    use_new_protocol: AtomicBool,
    initialized: AtomicBool,
    request_timeout: Duration,
    exited: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AcpChannel {
    /// Spawns the CLI and wires up the stdio tasks.
    pub async fn spawn(
        config: ChannelConfig,
        handlers: ChannelHandlers,
    ) -> Result<Self, AgentError> {
        let mut command =
            cli::build_command(&config.binary, config.model.as_deref(), &config.add_dirs);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            binary: config.binary.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let exited = CancellationToken::new();

        let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
        let reader_handle = tokio::spawn(reader_task(
            stdout,
            pending.clone(),
            handlers,
            writer_tx.clone(),
            exited.clone(),
        ));
        let mut tasks = vec![writer_handle, reader_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr)));
        }

        Ok(Self {
            writer: writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            child: Arc::new(Mutex::new(Some(child))),
            pid,
            use_new_protocol: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            request_timeout: config.request_timeout,
            exited,
            tasks,
        })
    }

    /// Pid of the spawned CLI.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the `initialize` handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether the remote negotiated dot-notation method names.
    pub fn uses_new_protocol(&self) -> bool {
        self.use_new_protocol.load(Ordering::SeqCst)
    }

    /// Performs the `initialize` handshake and records the negotiated
    /// protocol version.
    pub async fn initialize(&self) -> Result<(), AgentError> {
        let params = json!({
            "clientInfo": {
                "name": "mote",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "protocolVersion": CLIENT_PROTOCOL_VERSION,
        });
        let result = self.request(METHOD_INITIALIZE, params).await?;
        let version = negotiated_protocol_version(&result);
        self.use_new_protocol.store(version >= 2, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        debug!(version, "initialize handshake complete");
        Ok(())
    }

    /// Creates a remote session rooted at `cwd`.
    ///
    /// The legacy `session/new` shape demands an array of MCP servers with
    /// `args` and `env` present as non-null arrays; the map shape is
    /// converted on the fly.
    pub async fn create_session(
        &self,
        cwd: &Path,
        servers: &McpServerMap,
        model: Option<&str>,
    ) -> Result<String, AgentError> {
        let mcp_servers = if self.uses_new_protocol() {
            mcp::to_wire_map(servers)
        } else {
            mcp::to_legacy_array(servers)
        };
        let mut params = json!({
            "cwd": cwd,
            "mcpServers": mcp_servers,
        });
        if let Some(model) = model {
            params["model"] = json!(model);
        }
        let method = self.method(METHOD_SESSION_CREATE, METHOD_SESSION_CREATE_LEGACY);
        let result = self.request(method, params).await?;
        parse_session_id(&result).ok_or(AgentError::MissingSessionId)
    }

    /// Sends a prompt turn and waits for the remote to finish it.
    pub async fn prompt(
        &self,
        session_id: &str,
        content: &[ContentBlock],
        cancel: &CancellationToken,
    ) -> Result<StopReason, AgentError> {
        let params = json!({
            "sessionId": session_id,
            "prompt": content,
        });
        let method = self.method(METHOD_SESSION_SEND, METHOD_SESSION_SEND_LEGACY);
        let result = self
            .request_with_cancel(method, params, Some(cancel))
            .await?;
        Ok(parse_stop_reason(&result))
    }

    /// Sends a permission decision as a notification.
    pub fn respond_to_permission(
        &self,
        session_id: &str,
        approved: bool,
    ) -> Result<(), AgentError> {
        let method = self.method(METHOD_PERMISSION_RESPONSE, METHOD_PERMISSION_RESPONSE_LEGACY);
        self.notify(
            method,
            json!({
                "sessionId": session_id,
                "approved": approved,
            }),
        )
    }

    /// Sends a request and waits for its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        self.request_with_cancel(method, params, None).await
    }

    /// Sends a request, racing the response against cancellation, the
    /// per-call timeout, and process death.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let serialized = serde_json::to_string(&message)?;

        let (tx, mut rx) = oneshot::channel();
        {
            self.pending.lock().await.insert(id, tx);
        }
        if self.writer.send(WriterMessage::Line(serialized)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AgentError::ChannelClosed);
        }

        let cancel = cancel.cloned();
        let cancelled = async {
            match &cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = &mut rx => match result {
                Ok(result) => result,
                Err(_) => Err(AgentError::ChannelClosed),
            },
            _ = cancelled => {
                // Drain in the background so a late response is consumed
                // instead of tripping the missing-channel warning.
                let pending = self.pending.clone();
                tokio::spawn(async move {
                    let _ = time::timeout(CANCEL_DRAIN_WINDOW, rx).await;
                    pending.lock().await.remove(&id);
                });
                Err(AgentError::Cancelled)
            }
            _ = time::sleep(self.request_timeout) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::Timeout(self.request_timeout))
            }
            _ = self.exited.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::ProcessDied)
            }
        }
    }

    /// Writes a notification; no id, no reply.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), AgentError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.writer
            .send(WriterMessage::Line(serde_json::to_string(&message)?))
            .map_err(|_| AgentError::ChannelClosed)
    }

    /// Closes stdin, waits up to five seconds for exit, force-kills if
    /// needed, and drains pending callers so nothing stays blocked.
    pub async fn close(&self) {
        let _ = self.writer.send(WriterMessage::Shutdown);

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("agent did not exit after stdin close, force-killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.exited.cancel();
        self.initialized.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(AgentError::ProcessDied));
        }
    }

    fn method(&self, new: &'static str, legacy: &'static str) -> &'static str {
        if self.uses_new_protocol() {
            new
        } else {
            legacy
        }
    }
}

impl Drop for AcpChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<WriterMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Line(line) => {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            WriterMessage::Shutdown => break,
        }
    }
    let _ = stdin.shutdown().await;
}

async fn reader_task(
    stdout: ChildStdout,
    pending: PendingRequests,
    handlers: ChannelHandlers,
    writer: mpsc::UnboundedSender<WriterMessage>,
    exited: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(error) => {
                warn!(error = %error, "skipping unparseable acp line");
                continue;
            }
        };

        let raw_id = value.get("id").cloned();
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match (raw_id, method) {
            (None, Some(method)) => {
                // Run to completion before reading the next line; the
                // per-channel ordering is load-bearing for permissions.
                match handlers.notification.as_ref() {
                    Some(handler) => handler(method, params).await,
                    None => debug!(method = %method, "notification dropped, no handler"),
                }
            }
            (Some(id), Some(method)) => {
                handle_incoming_request(id, method, params, &handlers, &writer);
            }
            (Some(id), None) => {
                let Some(id) = id.as_u64() else {
                    warn!(id = %id, "response with non-numeric id");
                    continue;
                };
                // An id of zero is a spurious acknowledgment some remotes
                // emit; discard without warning.
                if id == 0 {
                    continue;
                }
                let sender = { pending.lock().await.remove(&id) };
                match sender {
                    Some(tx) => deliver_response(tx, &value),
                    None => warn!(id, "no pending channel for response"),
                }
            }
            (None, None) => warn!("acp object with neither id nor method"),
        }
    }

    exited.cancel();
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(AgentError::ProcessDied));
    }
}

async fn stderr_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("copilot stderr: {line}");
    }
}

fn deliver_response(tx: oneshot::Sender<Result<Value, AgentError>>, value: &Value) {
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = error.get("data").cloned();
        let _ = tx.send(Err(AgentError::Rpc {
            code,
            message,
            data,
        }));
    } else {
        let result = value.get("result").cloned().unwrap_or(Value::Null);
        let _ = tx.send(Ok(result));
    }
}

fn handle_incoming_request(
    id: Value,
    method: String,
    params: Value,
    handlers: &ChannelHandlers,
    writer: &mpsc::UnboundedSender<WriterMessage>,
) {
    match method.as_str() {
        METHOD_PERMISSION_REQUEST | METHOD_PERMISSION_REQUEST_LEGACY => {
            // Auto-approve inline so the reply is queued before the next
            // line is read; the remote blocks on it.
            let chosen = choose_permission_option(&params);
            debug!(option = %chosen, "auto-approving permission request");
            write_response(writer, id, Ok(json!({
                "outcome": {"outcome": "selected", "optionId": chosen},
            })));

            // Older remotes expect a permission-response notification
            // instead of (or in addition to) the JSON-RPC result.
            let session_id = params
                .get("sessionId")
                .or_else(|| params.get("session_id"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let note = json!({
                "jsonrpc": "2.0",
                "method": METHOD_PERMISSION_RESPONSE_LEGACY,
                "params": {
                    "sessionId": session_id,
                    "approved": true,
                    "optionId": chosen,
                },
            });
            let _ = writer.send(WriterMessage::Line(note.to_string()));
        }
        METHOD_TOOL_CALL => {
            let Some(handler) = handlers.tool_call.clone() else {
                write_response(
                    writer,
                    id,
                    Err((-32601, "no tool handler registered".to_string())),
                );
                return;
            };
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = params
                .get("arguments")
                .or_else(|| params.get("input"))
                .cloned()
                .unwrap_or(Value::Null);
            let writer = writer.clone();
            tokio::spawn(async move {
                let outcome = handler(name, arguments).await;
                write_response(&writer, id, Ok(tools::bridged_result(outcome)));
            });
        }
        METHOD_HOOKS_INVOKE => match handlers.hooks.clone() {
            Some(handler) => {
                let writer = writer.clone();
                tokio::spawn(async move {
                    let decision = handler(params).await;
                    write_response(&writer, id, Ok(decision));
                });
            }
            None => write_response(writer, id, Ok(json!({"decision": "allow"}))),
        },
        other => {
            warn!(method = other, "unknown incoming method");
            write_response(
                writer,
                id,
                Err((-32601, format!("method `{other}` not found"))),
            );
        }
    }
}

fn choose_permission_option(params: &Value) -> String {
    let Some(options) = params.get("options").and_then(Value::as_array) else {
        return "allow_once".to_string();
    };
    for preferred in ["allow_always", "allow_once"] {
        for option in options {
            let kind = option
                .get("kind")
                .or_else(|| option.get("optionId"))
                .or_else(|| option.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if kind == preferred {
                return option
                    .get("optionId")
                    .or_else(|| option.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or(kind)
                    .to_string();
            }
        }
    }
    options
        .first()
        .and_then(|option| {
            option
                .get("optionId")
                .or_else(|| option.get("id"))
                .and_then(Value::as_str)
        })
        .unwrap_or("allow_once")
        .to_string()
}

fn write_response(
    writer: &mpsc::UnboundedSender<WriterMessage>,
    id: Value,
    result: Result<Value, (i64, String)>,
) {
    let message = match result {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }),
    };
    let _ = writer.send(WriterMessage::Line(message.to_string()));
}
