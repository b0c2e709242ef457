//! Gateway wire protocol definitions.
//!
//! All communication with a paired device uses JSON frames over one
//! persistent WebSocket. Every frame carries a `type` (dotted message
//! name), an `id` (correlation identifier chosen by the sender) and a
//! `payload`. Outbound events for a chat stream or shell tab reuse the
//! `id` of the request that started them, so the client can demultiplex
//! concurrent streams sharing the socket.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KB

// ── Message types ────────────────────────────────────────────────────────────

pub mod types {
    // Inbound (client → gateway).
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_CANCEL: &str = "chat.cancel";
    pub const SHELL_EXEC: &str = "shell.exec";
    pub const SHELL_INPUT: &str = "shell.input";
    pub const SHELL_KILL: &str = "shell.kill";

    // Outbound (gateway → client).
    pub const CHAT_TOKEN: &str = "chat.token";
    pub const CHAT_TOOL_START: &str = "chat.tool_start";
    pub const CHAT_TOOL_RESULT: &str = "chat.tool_result";
    pub const CHAT_DONE: &str = "chat.done";
    pub const CHAT_ERROR: &str = "chat.error";
    pub const SHELL_OUTPUT: &str = "shell.output";
    pub const SHELL_EXIT: &str = "shell.exit";
    pub const ERROR: &str = "error";
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// A single frame on the wire, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub r#type: String,
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new(
        r#type: impl Into<String>,
        id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            id: id.into(),
            payload,
        }
    }

    /// Diagnostic frame for a malformed or unroutable inbound message.
    /// The connection stays open after sending one of these.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            types::ERROR,
            id,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// A named kind of AI function. Closed set; every chat request names
/// exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Language,
    Reasoning,
    Vision,
    Stt,
    Tts,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Language,
        Capability::Reasoning,
        Capability::Vision,
        Capability::Stt,
        Capability::Tts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Language => "language",
            Capability::Reasoning => "reasoning",
            Capability::Vision => "vision",
            Capability::Stt => "stt",
            Capability::Tts => "tts",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Chat payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat history as sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Base64-encoded images for vision requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            images: None,
        }
    }
}

/// `chat.send` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSendParams {
    pub capability: Capability,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// `chat.token` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTokenPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub token: String,
}

/// `chat.done` terminal event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDonePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub message_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
}

/// `chat.error` terminal event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatErrorPayload {
    pub message: String,
}

/// `chat.cancel` request payload. Names the `chat.send` frame to stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCancelParams {
    pub id: String,
}

// ── Shell payloads ───────────────────────────────────────────────────────────

/// Which pipe of the child process a `shell.output` chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// `shell.exec` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellExecParams {
    pub tab_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// `shell.input` request payload. Raw bytes for the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellInputParams {
    pub tab_id: String,
    pub data: String,
}

/// `shell.kill` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellKillParams {
    pub tab_id: String,
}

/// `shell.output` event payload. One chunk as delivered by the OS pipe;
/// no line reassembly is guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutputPayload {
    pub tab_id: String,
    pub data: String,
    pub stream: StreamName,
}

/// `shell.exit` event payload. Emitted exactly once per spawned process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellExitPayload {
    pub tab_id: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::new(
            types::SHELL_EXEC,
            "m1",
            serde_json::json!({ "tab_id": "t1", "command": "ls" }),
        );
        let text = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.r#type, "shell.exec");
        assert_eq!(back.id, "m1");
        let params: ShellExecParams = serde_json::from_value(back.payload).unwrap();
        assert_eq!(params.tab_id, "t1");
        assert_eq!(params.command, "ls");
        assert!(params.cwd.is_none());
    }

    #[test]
    fn frame_missing_payload_defaults_to_null() {
        let back: Frame = serde_json::from_str(r#"{"type":"shell.kill","id":"m2"}"#).unwrap();
        assert!(back.payload.is_null());
    }

    #[test]
    fn capability_wire_names() {
        assert_eq!(
            serde_json::to_value(Capability::Language).unwrap(),
            serde_json::json!("language")
        );
        assert_eq!(
            serde_json::to_value(Capability::Stt).unwrap(),
            serde_json::json!("stt")
        );
        let cap: Capability = serde_json::from_value(serde_json::json!("vision")).unwrap();
        assert_eq!(cap, Capability::Vision);
    }

    #[test]
    fn stream_name_serializes_lowercase() {
        let payload = ShellOutputPayload {
            tab_id: "t1".into(),
            data: "hi".into(),
            stream: StreamName::Stderr,
        };
        let val = serde_json::to_value(&payload).unwrap();
        assert_eq!(val["stream"], "stderr");
    }

    #[test]
    fn chat_done_skips_absent_fields() {
        let payload = ChatDonePayload {
            conversation_id: None,
            message_id: "msg1".into(),
            content: "hello".into(),
            model: None,
            tokens_used: None,
        };
        let val = serde_json::to_value(&payload).unwrap();
        assert!(val.get("model").is_none());
        assert!(val.get("tokens_used").is_none());
        assert!(val.get("conversation_id").is_none());
    }
}
