//! Prompt assembly: system prefix, conversation-history injection for
//! brand-new sessions, and attachment handling.

use std::path::Path;

use crate::protocol::ContentBlock;

/// Longest serialized turn carried into an injected history block.
pub const HISTORY_TURN_LIMIT: usize = 4000;

/// Role of one chat message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    fn label(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One chat message from the caller's transcript.
#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A file attached to the current turn.
///
/// Image data may arrive wrapped in a data URI; text content is carried
/// verbatim.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub name: String,
    pub media_type: Option<String>,
    pub data: String,
}

/// Builds the prompt content array for one turn.
///
/// The system message, when present, prefixes the text. When
/// `include_history` is set (a freshly created remote session) and the
/// transcript carries prior turns, they are serialized into a
/// `<conversation_history>` block ahead of the current message; reused
/// sessions skip this because the remote keeps its own transcript.
pub fn build_prompt(
    system_message: Option<&str>,
    messages: &[ChatMessage],
    attachments: &[Attachment],
    include_history: bool,
) -> Vec<ContentBlock> {
    let mut text = String::new();

    if let Some(system) = system_message {
        if !system.is_empty() {
            text.push_str(system);
            text.push_str("\n\n");
        }
    }
    for message in messages.iter().filter(|m| m.role == MessageRole::System) {
        text.push_str(&message.content);
        text.push_str("\n\n");
    }

    let transcript: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .collect();
    let (current, prior) = match transcript.split_last() {
        Some((current, prior)) => (Some(*current), prior),
        None => (None, &[][..]),
    };

    if include_history && !prior.is_empty() {
        text.push_str(&serialize_history(prior));
        text.push_str("\n\n");
    }
    if let Some(current) = current {
        text.push_str(&current.content);
    }

    let mut blocks = Vec::new();
    let mut images = Vec::new();
    for attachment in attachments {
        match image_payload(attachment) {
            Some((mime_type, data)) => images.push(ContentBlock::Image { mime_type, data }),
            None => {
                text.push_str(&fenced_attachment(attachment));
            }
        }
    }

    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }
    blocks.extend(images);
    blocks
}

fn serialize_history(turns: &[&ChatMessage]) -> String {
    let mut block = String::from("<conversation_history>\n");
    for turn in turns {
        let mut content = turn.content.as_str();
        if content.len() > HISTORY_TURN_LIMIT {
            let mut cut = HISTORY_TURN_LIMIT;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content = &content[..cut];
        }
        block.push_str(turn.role.label());
        block.push_str(": ");
        block.push_str(content);
        if content.len() < turn.content.len() {
            block.push_str("[truncated]");
        }
        block.push('\n');
    }
    block.push_str("</conversation_history>");
    block
}

/// Extracts `(mime type, base64)` when the attachment is an image,
/// unwrapping a `data:` URI if present.
fn image_payload(attachment: &Attachment) -> Option<(String, String)> {
    if let Some((mime_type, data)) = parse_data_uri(&attachment.data) {
        if mime_type.starts_with("image/") {
            return Some((mime_type, data));
        }
        return None;
    }
    match &attachment.media_type {
        Some(media_type) if media_type.starts_with("image/") => {
            Some((media_type.clone(), attachment.data.clone()))
        }
        _ => None,
    }
}

fn parse_data_uri(data: &str) -> Option<(String, String)> {
    let rest = data.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64").unwrap_or(header);
    Some((mime_type.to_string(), payload.to_string()))
}

fn fenced_attachment(attachment: &Attachment) -> String {
    let language = fence_language(&attachment.name);
    format!(
        "\n\n`{}`:\n```{}\n{}\n```",
        attachment.name, language, attachment.data
    )
}

fn fence_language(name: &str) -> &str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    match extension {
        "rs" => "rust",
        "py" => "python",
        "js" => "javascript",
        "ts" => "typescript",
        "md" => "markdown",
        "yml" => "yaml",
        other => other,
    }
}
