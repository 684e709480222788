use std::{
    future::Future,
    path::PathBuf,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, Mutex},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    channel::{
        AcpChannel, ChannelConfig, ChannelHandlers, HooksHandler, NotificationHandler,
        ToolCallHandler, DEFAULT_REQUEST_TIMEOUT,
    },
    cli, mcp,
    prompt::{self, Attachment, ChatMessage},
    protocol::{
        parse_session_update, AgentEvent, SessionUpdate, ToolCallInfo, METHOD_SESSION_EVENT,
        METHOD_SESSION_EVENT_LEGACY,
    },
    tools::{self, SharedToolRegistry},
    AgentError,
};

/// Conversation id used when the caller does not name one.
pub const DEFAULT_CONVERSATION: &str = "default";

/// Bounded capacity of each per-conversation event sink.
pub const EVENT_SINK_CAPACITY: usize = 100;

/// Fallback model when the requested one cannot be driven over ACP.
pub const DEFAULT_ACP_MODEL: &str = "gpt-5";

const ACP_MODEL_PREFIXES: &[&str] = &["gpt-", "claude-", "o4"];
const RESTART_WAIT: Duration = Duration::from_secs(10);

/// Maps a conversation id to the working directory its session should use.
pub type WorkdirResolver = Arc<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

/// Host-side pause gate consulted before tool activity.
pub trait PauseController: Send + Sync {
    /// Completes immediately when not paused, otherwise blocks until
    /// resumed. Returns user-provided text when the resume carried any;
    /// that text denies (hook path) or skips (event path) the tool call.
    fn wait_if_paused(&self) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>>;
}

/// Adapter configuration.
#[derive(Clone, Default)]
pub struct AgentConfig {
    /// Explicit CLI path; discovery runs when absent.
    pub binary: Option<PathBuf>,
    /// Default model for conversations that do not request one.
    pub model: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub system_message: Option<String>,
    pub workdir_resolver: Option<WorkdirResolver>,
    /// Local tools never bridged to the remote, in addition to the CLI's
    /// native set.
    pub excluded_tools: Vec<String>,
    /// Overrides the canonical MCP config file location.
    pub mcp_config_path: Option<PathBuf>,
    pub request_timeout: Option<Duration>,
}

/// One streaming chat request.
#[derive(Clone, Default)]
pub struct StreamRequest {
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub attachments: Vec<Attachment>,
}

/// Handle to an in-flight stream: the event receiver plus its
/// cancellation token.
pub struct AgentStream {
    events: mpsc::Receiver<AgentEvent>,
    cancel: CancellationToken,
}

impl AgentStream {
    /// Next event, or `None` once the stream is finished.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Cancels the in-flight prompt; the adapter recovers by restarting
    /// the CLI.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct Subscription {
    entry_id: u64,
    sink: mpsc::Sender<AgentEvent>,
    seen_tools: Arc<DashSet<String>>,
}

/// Stateful driver over the ACP channel.
///
/// Maintains per-conversation remote sessions, routes streaming updates
/// to subscribers, bridges local tools into the remote agent, and
/// recovers from prompt cancellation by tearing the CLI down and
/// spawning a fresh one.
pub struct AgentAdapter {
    config: AgentConfig,
    channel: Mutex<Option<Arc<AcpChannel>>>,
    sessions: Arc<DashMap<String, String>>,
    conversations: Arc<DashMap<String, String>>,
    models: Arc<DashMap<String, String>>,
    subscriptions: Arc<DashMap<String, Subscription>>,
    next_entry_id: AtomicU64,
    restarting: Arc<AtomicBool>,
    tools: Option<SharedToolRegistry>,
    pause: Option<Arc<dyn PauseController>>,
}

impl AgentAdapter {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
            sessions: Arc::new(DashMap::new()),
            conversations: Arc::new(DashMap::new()),
            models: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            next_entry_id: AtomicU64::new(1),
            restarting: Arc::new(AtomicBool::new(false)),
            tools: None,
            pause: None,
        }
    }

    /// Installs a local tool registry bridged behind `tool.call`.
    pub fn with_tools(mut self, tools: SharedToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Installs a pause controller consulted before tool activity.
    pub fn with_pause(mut self, pause: Arc<dyn PauseController>) -> Self {
        self.pause = Some(pause);
        self
    }

    /// Starts one streaming turn.
    ///
    /// Events arrive on the returned stream in the order the remote
    /// reports them; a full sink drops events rather than blocking the
    /// reader.
    pub async fn stream(self: &Arc<Self>, request: StreamRequest) -> Result<AgentStream, AgentError> {
        let conversation = request
            .conversation_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());

        let channel = self.ensure_initialized().await?;
        let (session_id, fresh_session) = self
            .ensure_session(&channel, &conversation, request.model.as_deref())
            .await?;

        let entry_id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(EVENT_SINK_CAPACITY);
        let cancel = CancellationToken::new();
        if let Some(previous) = self.subscriptions.insert(
            conversation.clone(),
            Subscription {
                entry_id,
                sink: tx.clone(),
                seen_tools: Arc::new(DashSet::new()),
            },
        ) {
            debug!(
                conversation = %conversation,
                superseded = previous.entry_id,
                "replacing event subscription"
            );
        }

        let content = prompt::build_prompt(
            self.config.system_message.as_deref(),
            &request.messages,
            &request.attachments,
            fresh_session,
        );

        let adapter = self.clone();
        let prompt_cancel = cancel.clone();
        tokio::spawn(async move {
            match channel.prompt(&session_id, &content, &prompt_cancel).await {
                Ok(stop_reason) => {
                    deliver(&tx, &conversation, AgentEvent::Done {
                        finish_reason: stop_reason.as_finish_reason(),
                    });
                }
                Err(AgentError::Cancelled) => {
                    warn!(conversation = %conversation, "prompt cancelled, restarting agent client");
                    adapter.restart_client().await;
                    deliver(&tx, &conversation, AgentEvent::Error {
                        message: "prompt cancelled".to_string(),
                    });
                    deliver(&tx, &conversation, AgentEvent::Done {
                        finish_reason: "stop",
                    });
                }
                Err(error) => {
                    deliver(&tx, &conversation, AgentEvent::Error {
                        message: error.to_string(),
                    });
                    deliver(&tx, &conversation, AgentEvent::Done {
                        finish_reason: "stop",
                    });
                }
            }

            // Only the owner of the live entry removes it; a later stream
            // for this conversation has already overwritten the slot.
            adapter
                .subscriptions
                .remove_if(&conversation, |_, subscription| {
                    subscription.entry_id == entry_id
                });
        });

        Ok(AgentStream { events: rx, cancel })
    }

    /// The nuclear recovery path: kill the CLI, clear every session
    /// mapping (they belong to the dead process), and start from scratch
    /// on the next call.
    pub async fn restart_client(&self) {
        self.restarting.store(true, Ordering::SeqCst);
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.sessions.clear();
        self.conversations.clear();
        self.models.clear();
        self.restarting.store(false, Ordering::SeqCst);
    }

    /// The remote session currently bound to a conversation.
    pub fn session_for(&self, conversation: &str) -> Option<String> {
        self.sessions
            .get(conversation)
            .map(|entry| entry.value().clone())
    }

    /// Pid of the live CLI process.
    pub async fn connected_pid(&self) -> Option<u32> {
        self.channel.lock().await.as_ref().and_then(|c| c.pid())
    }

    async fn ensure_initialized(&self) -> Result<Arc<AcpChannel>, AgentError> {
        // A concurrent restart owns the channel slot; wait it out instead
        // of racing it.
        let deadline = time::Instant::now() + RESTART_WAIT;
        while self.restarting.load(Ordering::SeqCst) {
            if time::Instant::now() >= deadline {
                return Err(AgentError::RestartPending);
            }
            time::sleep(Duration::from_millis(50)).await;
        }

        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.is_initialized() {
                return Ok(channel.clone());
            }
        }

        let binary = cli::resolve_binary(self.config.binary.as_deref())?;
        let mut channel_config = ChannelConfig::new(binary);
        channel_config.model = self.config.model.clone();
        channel_config.add_dirs = self.config.working_dir.iter().cloned().collect();
        if let Some(timeout) = self.config.request_timeout {
            channel_config.request_timeout = timeout;
        } else {
            channel_config.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }

        let channel = Arc::new(AcpChannel::spawn(channel_config, self.channel_handlers()).await?);
        channel.initialize().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn ensure_session(
        &self,
        channel: &Arc<AcpChannel>,
        conversation: &str,
        requested_model: Option<&str>,
    ) -> Result<(String, bool), AgentError> {
        let mut model = requested_model
            .or(self.config.model.as_deref())
            .unwrap_or(DEFAULT_ACP_MODEL)
            .to_string();
        if !is_acp_model(&model) {
            warn!(model = %model, fallback = DEFAULT_ACP_MODEL, "model not supported over acp");
            model = DEFAULT_ACP_MODEL.to_string();
        }

        if let Some(existing) = self.session_for(conversation) {
            let recorded = self
                .models
                .get(conversation)
                .map(|entry| entry.value().clone());
            if recorded.as_deref() == Some(model.as_str()) {
                return Ok((existing, false));
            }
            // Model switch invalidates the binding; both direction maps go
            // together.
            debug!(conversation = %conversation, model = %model, "model changed, dropping session");
            self.sessions.remove(conversation);
            self.conversations.remove(&existing);
            self.models.remove(conversation);
        }

        let cwd = self.resolve_workdir(conversation);
        let servers = self.load_mcp_servers();
        let session_id = channel
            .create_session(&cwd, &servers, Some(&model))
            .await?;

        self.sessions
            .insert(conversation.to_string(), session_id.clone());
        self.conversations
            .insert(session_id.clone(), conversation.to_string());
        self.models.insert(conversation.to_string(), model);

        Ok((session_id, true))
    }

    fn resolve_workdir(&self, conversation: &str) -> PathBuf {
        if let Some(resolver) = &self.config.workdir_resolver {
            if let Some(dir) = resolver(conversation) {
                return dir;
            }
        }
        if let Some(dir) = &self.config.working_dir {
            return dir.clone();
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }

    /// Re-reads the on-disk MCP config so servers added at runtime are
    /// visible to new sessions. Read failures degrade to no servers.
    fn load_mcp_servers(&self) -> mcp::McpServerMap {
        let path = self
            .config
            .mcp_config_path
            .clone()
            .or_else(mcp::default_path);
        let Some(path) = path else {
            return mcp::McpServerMap::new();
        };
        match mcp::load(&path) {
            Ok(servers) => servers,
            Err(error) => {
                warn!(error = %error, "ignoring unreadable mcp config");
                mcp::McpServerMap::new()
            }
        }
    }

    fn channel_handlers(&self) -> ChannelHandlers {
        let conversations = self.conversations.clone();
        let subscriptions = self.subscriptions.clone();
        let pause = self.pause.clone();
        let notification: NotificationHandler = Arc::new(move |method, params| {
            let conversations = conversations.clone();
            let subscriptions = subscriptions.clone();
            let pause = pause.clone();
            Box::pin(async move {
                if method != METHOD_SESSION_EVENT && method != METHOD_SESSION_EVENT_LEGACY {
                    debug!(method = %method, "ignoring notification");
                    return;
                }
                route_session_update(&conversations, &subscriptions, pause.as_deref(), &params)
                    .await;
            })
        });

        let tool_call: Option<ToolCallHandler> = self.tools.clone().map(|registry| {
            let excluded = self.config.excluded_tools.clone();
            let handler: ToolCallHandler = Arc::new(move |name, arguments| {
                let registry = registry.clone();
                let excluded = excluded.clone();
                Box::pin(async move {
                    let local = tools::local_tool_name(&name).to_string();
                    if tools::is_native_tool(&local) || excluded.contains(&local) {
                        return Err(format!("tool `{local}` is not bridged"));
                    }
                    registry.invoke(&local, arguments).await
                }) as tools::ToolFuture
            });
            handler
        });

        let hooks: Option<HooksHandler> = self.pause.clone().map(|pause| {
            let handler: HooksHandler = Arc::new(move |params: Value| {
                let pause = pause.clone();
                Box::pin(async move {
                    let hook = params
                        .get("hook")
                        .or_else(|| params.get("hookName"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if hook == "preToolUse" {
                        if let Some(reason) = pause.wait_if_paused().await {
                            return json!({"decision": "deny", "reason": reason});
                        }
                    }
                    json!({"decision": "allow"})
                }) as crate::channel::HooksFuture
            });
            handler
        });

        ChannelHandlers {
            notification: Some(notification),
            tool_call,
            hooks,
        }
    }
}

fn is_acp_model(model: &str) -> bool {
    ACP_MODEL_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

async fn route_session_update(
    conversations: &DashMap<String, String>,
    subscriptions: &DashMap<String, Subscription>,
    pause: Option<&dyn PauseController>,
    params: &Value,
) {
    let Some((session_id, update)) = parse_session_update(params) else {
        debug!("unrecognized session update");
        return;
    };
    let Some(conversation) = conversations
        .get(&session_id)
        .map(|entry| entry.value().clone())
    else {
        debug!(session = %session_id, "update for unknown session");
        return;
    };
    // Clone what we need out of the map guard; the pause gate below may
    // block for a while.
    let (sink, seen_tools) = match subscriptions.get(&conversation) {
        Some(subscription) => (subscription.sink.clone(), subscription.seen_tools.clone()),
        None => {
            debug!(conversation = %conversation, "update with no subscriber");
            return;
        }
    };

    match update {
        SessionUpdate::AgentMessageChunk { text } => {
            deliver(&sink, &conversation, AgentEvent::ContentDelta { text });
        }
        SessionUpdate::AgentThoughtChunk { text } | SessionUpdate::Thinking { text } => {
            deliver(&sink, &conversation, AgentEvent::ThinkingDelta { text });
        }
        SessionUpdate::AgentMessageDone | SessionUpdate::ThinkingDone => {}
        SessionUpdate::ToolCallStart(info) | SessionUpdate::ToolCall(info) => {
            emit_tool_events(
                &sink,
                &conversation,
                &seen_tools,
                pause,
                info,
                Some("running"),
            )
            .await;
        }
        SessionUpdate::ToolCallUpdate(info) => {
            emit_tool_events(&sink, &conversation, &seen_tools, pause, info, None).await;
        }
        SessionUpdate::ToolCallComplete(info) => {
            emit_tool_events(
                &sink,
                &conversation,
                &seen_tools,
                pause,
                info,
                Some("completed"),
            )
            .await;
        }
    }
}

/// Emits the `tool_call` / `tool_call_update` pair for one update.
///
/// A call id seen for the first time produces a `tool_call` event before
/// its status update; `status_override` pins the status for start and
/// complete variants while plain updates carry the remote-reported one.
async fn emit_tool_events(
    sink: &mpsc::Sender<AgentEvent>,
    conversation: &str,
    seen_tools: &DashSet<String>,
    pause: Option<&dyn PauseController>,
    info: ToolCallInfo,
    status_override: Option<&'static str>,
) {
    if !seen_tools.contains(&info.id) {
        if let Some(pause) = pause {
            if let Some(_user_text) = pause.wait_if_paused().await {
                debug!(tool = %info.name, "tool call skipped while paused");
                return;
            }
        }
        seen_tools.insert(info.id.clone());
        deliver(
            sink,
            conversation,
            AgentEvent::ToolCall {
                id: info.id.clone(),
                name: info.name.clone(),
                arguments: info.arguments.clone(),
            },
        );
    }

    let status = match status_override {
        Some(status) => status.to_string(),
        None => info.status.unwrap_or_else(|| "running".to_string()),
    };
    deliver(
        sink,
        conversation,
        AgentEvent::ToolCallUpdate {
            id: info.id,
            status,
        },
    );
}

fn deliver(sink: &mpsc::Sender<AgentEvent>, conversation: &str, event: AgentEvent) {
    match sink.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!(conversation = %conversation, event = ?event, "event sink full, dropping");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conversation = %conversation, "subscriber gone");
        }
    }
}
