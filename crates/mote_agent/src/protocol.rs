use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC method used for the initial handshake.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Creates a remote session (protocol >= 2).
pub const METHOD_SESSION_CREATE: &str = "session.create";
/// Creates a remote session (legacy slash notation).
pub const METHOD_SESSION_CREATE_LEGACY: &str = "session/new";
/// Sends a prompt turn (protocol >= 2).
pub const METHOD_SESSION_SEND: &str = "session.send";
/// Sends a prompt turn (legacy).
pub const METHOD_SESSION_SEND_LEGACY: &str = "session/prompt";
/// Streaming session-update notification (protocol >= 2).
pub const METHOD_SESSION_EVENT: &str = "session.event";
/// Streaming session-update notification (legacy).
pub const METHOD_SESSION_EVENT_LEGACY: &str = "session/update";
/// Incoming permission request (protocol >= 2).
pub const METHOD_PERMISSION_REQUEST: &str = "permission.request";
/// Incoming permission request (legacy).
pub const METHOD_PERMISSION_REQUEST_LEGACY: &str = "session/request_permission";
/// Permission response notification (protocol >= 2).
pub const METHOD_PERMISSION_RESPONSE: &str = "permission.response";
/// Permission response notification (legacy).
pub const METHOD_PERMISSION_RESPONSE_LEGACY: &str = "session/permission_response";
/// Incoming bridged tool invocation.
pub const METHOD_TOOL_CALL: &str = "tool.call";
/// Incoming hook invocation.
pub const METHOD_HOOKS_INVOKE: &str = "hooks.invoke";

/// Protocol version this client speaks natively.
pub const CLIENT_PROTOCOL_VERSION: u32 = 2;

/// Client metadata attached to the `initialize` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// One block of prompt content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
}

/// Why the remote finished a prompt turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    /// External finish-reason label for API consumers.
    pub fn as_finish_reason(self) -> &'static str {
        match self {
            Self::EndTurn | Self::StopSequence => "stop",
            Self::ToolUse => "tool_calls",
            Self::MaxTokens => "length",
        }
    }
}

/// Tool-call metadata carried by streaming updates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    pub arguments: Option<Value>,
}

/// Decoded session-update variant.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionUpdate {
    AgentMessageChunk { text: String },
    AgentMessageDone,
    AgentThoughtChunk { text: String },
    Thinking { text: String },
    ThinkingDone,
    ToolCallStart(ToolCallInfo),
    ToolCall(ToolCallInfo),
    ToolCallUpdate(ToolCallInfo),
    ToolCallComplete(ToolCallInfo),
}

/// Event delivered to stream subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    ContentDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Option<Value>,
    },
    ToolCallUpdate {
        id: String,
        status: String,
    },
    Error {
        message: String,
    },
    Done {
        finish_reason: &'static str,
    },
}

/// Extracts the negotiated protocol version from an `initialize` result.
///
/// The field has been observed both as a number and a string; absent or
/// unreadable values fall back to the legacy protocol.
pub fn negotiated_protocol_version(result: &Value) -> u32 {
    let field = result
        .get("protocolVersion")
        .or_else(|| result.get("protocol_version"));
    match field {
        Some(Value::Number(number)) => number.as_u64().unwrap_or(1) as u32,
        Some(Value::String(text)) => text
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .unwrap_or(1),
        _ => 1,
    }
}

/// Parses a `session.event` / `session/update` notification payload into
/// its session id and update, tolerating both the nested (`toolCall`
/// object) and flat (`toolCallId` + `title`) wire shapes.
pub fn parse_session_update(params: &Value) -> Option<(String, SessionUpdate)> {
    let session_id = params
        .get("sessionId")
        .or_else(|| params.get("session_id"))
        .and_then(Value::as_str)?
        .to_string();
    let update = params.get("update").unwrap_or(params);
    let kind = update
        .get("sessionUpdate")
        .or_else(|| update.get("session_update"))
        .or_else(|| update.get("type"))
        .and_then(Value::as_str)?;

    let update = match kind {
        "agent_message_chunk" => SessionUpdate::AgentMessageChunk {
            text: extract_text(update),
        },
        "agent_message_done" => SessionUpdate::AgentMessageDone,
        "agent_thought_chunk" => SessionUpdate::AgentThoughtChunk {
            text: extract_text(update),
        },
        "thinking" => SessionUpdate::Thinking {
            text: extract_text(update),
        },
        "thinking_done" => SessionUpdate::ThinkingDone,
        "tool_call_start" => SessionUpdate::ToolCallStart(extract_tool_call(update)?),
        "tool_call" => SessionUpdate::ToolCall(extract_tool_call(update)?),
        "tool_call_update" => SessionUpdate::ToolCallUpdate(extract_tool_call(update)?),
        "tool_call_complete" => SessionUpdate::ToolCallComplete(extract_tool_call(update)?),
        _ => return None,
    };
    Some((session_id, update))
}

fn extract_text(update: &Value) -> String {
    update
        .get("content")
        .and_then(|content| {
            content
                .get("text")
                .and_then(Value::as_str)
                .or_else(|| content.as_str())
        })
        .or_else(|| update.get("text").and_then(Value::as_str))
        .or_else(|| update.get("delta").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn extract_tool_call(update: &Value) -> Option<ToolCallInfo> {
    // Nested shape: the update carries a `toolCall` object.
    let nested = update.get("toolCall").or_else(|| update.get("tool_call"));
    let source = nested.unwrap_or(update);

    let id = source
        .get("toolCallId")
        .or_else(|| source.get("tool_call_id"))
        .or_else(|| source.get("id"))
        .and_then(Value::as_str)?
        .to_string();
    let name = source
        .get("title")
        .or_else(|| source.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let status = source
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string);
    let arguments = source
        .get("rawInput")
        .or_else(|| source.get("raw_input"))
        .or_else(|| source.get("arguments"))
        .cloned();

    Some(ToolCallInfo {
        id,
        name,
        status,
        arguments,
    })
}

/// Parses the stop reason out of a `session.send` result, defaulting to
/// end-turn for unknown labels.
pub fn parse_stop_reason(result: &Value) -> StopReason {
    let label = result
        .get("stopReason")
        .or_else(|| result.get("stop_reason"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    match label {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

/// Extracts the session id from a `session.create` result.
pub fn parse_session_id(result: &Value) -> Option<String> {
    result
        .get("sessionId")
        .or_else(|| result.get("session_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
