use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One event from the chat endpoint's `data: ` line stream.
///
/// Transient: events are never persisted, they only fold into message
/// state. Unknown `type` tags fail to parse and are dropped by the decoder
/// like any other malformed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The backend started a tool invocation; `description` is shown as a
    /// status line.
    ToolCall {
        #[serde(default)]
        name: Option<String>,
        description: String,
    },
    /// Incremental assistant text.
    TextChunk {
        #[serde(default)]
        text: String,
    },
    /// A tool finished; some tool names trigger a host-page reload.
    ToolResult { name: String },
    /// Turn boundary: finalizes the streaming message (or carries the whole
    /// reply for non-streamed turns) and may replace the suggestion set.
    Response {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        suggested_actions: Option<Vec<String>>,
    },
}

/// A chat message within a tab.
///
/// `id` exists only while the message is streaming; finalization clears it,
/// after which the message is no longer addressable in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip)]
    pub id: Option<Uuid>,
    pub text: String,
    pub is_user: bool,
    #[serde(default)]
    pub is_status: bool,
    #[serde(default)]
    pub is_streaming: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            is_user: true,
            is_status: false,
            is_streaming: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            is_user: false,
            is_status: false,
            is_streaming: false,
        }
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            is_user: false,
            is_status: true,
            is_streaming: false,
        }
    }

    pub(crate) fn streaming(id: Uuid, text: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            text: text.into(),
            is_user: false,
            is_status: false,
            is_streaming: true,
        }
    }
}

/// File attachment sent alongside a chat message (payload base64-encoded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}
