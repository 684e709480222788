use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::IpcError;

/// Protocol version stamped on every message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Process class a connection claims when registering with the broker.
///
/// Exactly one `main` exists per broker; at most one client per non-main
/// role is connected at a time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Main,
    Tray,
    Bubble,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Tray => "tray",
            Self::Bubble => "bubble",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "main" => Some(Self::Main),
            "tray" => Some(Self::Tray),
            "bubble" => Some(Self::Bubble),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level discriminant carried in the `type` field.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Register,
    StatusUpdate,
    ShowNotification,
    CloseNotification,
    Action,
    Exit,
    Ping,
    Pong,
    Error,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::StatusUpdate => "status_update",
            Self::ShowNotification => "show_notification",
            Self::CloseNotification => "close_notification",
            Self::Action => "action",
            Self::Exit => "exit",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message envelope exchanged between the main process and helpers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    pub id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub source: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl IpcMessage {
    /// Builds a broadcast message (no target) with a fresh id and timestamp.
    pub fn new(kind: MessageKind, source: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION.to_string(),
            kind,
            source,
            target: None,
            payload: None,
            timestamp: unix_millis(),
            reply_to: None,
        }
    }

    /// Builds a message addressed to a single role.
    pub fn to(kind: MessageKind, source: Role, target: Role) -> Self {
        let mut message = Self::new(kind, source);
        message.target = Some(target);
        message
    }

    /// Attaches a serialized payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, IpcError> {
        self.payload = Some(serde_json::to_value(payload).map_err(IpcError::Serialize)?);
        Ok(self)
    }

    /// Marks this message as a reply to an earlier request.
    pub fn in_reply_to(mut self, id: impl Into<String>) -> Self {
        self.reply_to = Some(id.into());
        self
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Payload of a `register` message; the first frame every client sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub role: Role,
    pub pid: u32,
}

/// Payload of a `status_update` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    pub status: ServiceStatus,
}

/// Textual service state broadcast to helpers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
}

/// Payload of a `show_notification` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
}

/// Verb carried by an `action` message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Show,
    Hide,
    ShowMainWindow,
    HideMainWindow,
    ShowBubble,
    Quit,
    RestartService,
}

/// Payload of an `action` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Payload of an `error` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Decodes the payload of a `register` message.
pub fn decode_register(message: &IpcMessage) -> Result<RegisterPayload, IpcError> {
    decode_payload(message, MessageKind::Register)
}

/// Decodes the payload of a `status_update` message.
pub fn decode_status_update(message: &IpcMessage) -> Result<StatusUpdatePayload, IpcError> {
    decode_payload(message, MessageKind::StatusUpdate)
}

/// Decodes the payload of a `show_notification` message.
pub fn decode_notification(message: &IpcMessage) -> Result<NotificationPayload, IpcError> {
    decode_payload(message, MessageKind::ShowNotification)
}

/// Decodes the payload of an `action` message.
pub fn decode_action(message: &IpcMessage) -> Result<ActionPayload, IpcError> {
    decode_payload(message, MessageKind::Action)
}

/// Decodes the payload of an `error` message.
pub fn decode_error(message: &IpcMessage) -> Result<ErrorPayload, IpcError> {
    decode_payload(message, MessageKind::Error)
}

fn decode_payload<T: for<'de> Deserialize<'de>>(
    message: &IpcMessage,
    expected: MessageKind,
) -> Result<T, IpcError> {
    if message.kind != expected {
        return Err(IpcError::KindMismatch {
            expected,
            actual: message.kind,
        });
    }
    let payload = message
        .payload
        .as_ref()
        .ok_or(IpcError::MissingPayload { kind: expected })?;
    serde_json::from_value(payload.clone()).map_err(IpcError::Deserialize)
}
