//! Raw runtime event protocol.
//!
//! The agent runtime delivers every event as a `RawEnvelope` (a string tag plus
//! an untyped JSON payload). The relay turns envelopes into `RawEvent`, a
//! closed enumeration with one arm per recognised tag, and matches on it
//! exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event as emitted by the runtime, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl RawEnvelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Event tags understood by the relay.
pub mod tags {
    pub const MESSAGE_DELTA: &str = "assistant.message_delta";
    pub const MESSAGE: &str = "assistant.message";
    pub const REASONING_DELTA: &str = "assistant.reasoning_delta";
    pub const REASONING: &str = "assistant.reasoning";
    pub const TURN_START: &str = "assistant.turn_start";
    pub const TURN_END: &str = "assistant.turn_end";
    pub const USAGE: &str = "assistant.usage";
    pub const USAGE_INFO: &str = "session.usage_info";
    pub const SESSION_IDLE: &str = "session.idle";
    pub const SESSION_ERROR: &str = "session.error";
    pub const TOOL_START: &str = "tool.execution_start";
    pub const TOOL_PROGRESS: &str = "tool.execution_progress";
    pub const TOOL_COMPLETE: &str = "tool.execution_complete";
    pub const FILE_CHANGED: &str = "file.changed";
}

// ── Payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub message_id: Option<String>,
    pub delta_content: String,
}

/// A tool call the assistant announced before the runtime executes it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolRequest {
    pub tool_call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_requests: Vec<ToolRequest>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReasoningDelta {
    #[serde(default)]
    pub reasoning_id: Option<String>,
    pub delta_content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reasoning {
    #[serde(default)]
    pub reasoning_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct TurnMarker {
    #[serde(default)]
    pub turn_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TurnUsage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContextUsage {
    pub current_tokens: u64,
    pub token_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionErrorPayload {
    #[serde(default)]
    pub error_type: String,
    pub message: String,
}

impl SessionErrorPayload {
    pub fn is_authentication(&self) -> bool {
        matches!(
            self.error_type.as_str(),
            "authentication" | "authentication_required" | "unauthorized"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolStart {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolProgress {
    pub tool_call_id: String,
    pub progress_message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolComplete {
    pub tool_call_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ToolComplete {
    /// Human-readable error text, whether the runtime sent a string or an object.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string()),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

/// Classified runtime event.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    MessageDelta(MessageDelta),
    Message(AssistantMessage),
    ReasoningDelta(ReasoningDelta),
    Reasoning(Reasoning),
    TurnStart(TurnMarker),
    TurnEnd(TurnMarker),
    Usage(TurnUsage),
    UsageInfo(ContextUsage),
    SessionIdle,
    SessionError(SessionErrorPayload),
    ToolStart(ToolStart),
    ToolProgress(ToolProgress),
    ToolComplete(ToolComplete),
    FileChanged(FileChange),
    /// Tag not in the recognised set.
    Unclassified { kind: String },
    /// Recognised tag whose payload failed to deserialize.
    Malformed { kind: String, reason: String },
}
