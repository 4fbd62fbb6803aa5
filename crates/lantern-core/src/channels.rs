//! Typed output channels.
//!
//! `CoreChannels` is built once per core instance and never rebuilt, so a
//! presentation layer subscribes to each channel exactly once no matter how
//! many times the active session changes. Every channel is an unbounded,
//! order-preserving queue with a single consumer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::CoreError;
use crate::tracker::diff::DiffSummary;
use crate::tracker::ToolExecutionState;

/// A created-once, single-subscriber event channel.
pub struct Channel<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    /// Events queued while nobody had subscribed
    backlog: AtomicUsize,
}

impl<T> Channel<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            backlog: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Claim the receiving end. Succeeds once per channel.
    ///
    /// Events emitted before the subscriber arrived are delivered first.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<T>, CoreError> {
        self.rx
            .lock()
            .take()
            .ok_or(CoreError::AlreadySubscribed { channel: self.name })
    }

    pub fn is_subscribed(&self) -> bool {
        self.rx.lock().is_none()
    }

    /// How many events were emitted before the subscriber arrived.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: T) {
        if !self.is_subscribed() && self.backlog.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!(
                channel = self.name,
                "No subscriber yet, events are queued until one subscribes"
            );
        }
        if self.tx.send(event).is_err() {
            warn!(
                channel = self.name,
                "Subscriber dropped, event has no listener"
            );
        }
    }
}

// ── Payloads ───────────────────────────────────────────────────────────

/// Assistant text, streamed (`is_final == false`) or complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputChunk {
    pub session_id: String,
    pub message_id: Option<String>,
    pub text: String,
    pub is_final: bool,
}

/// Assistant reasoning text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningChunk {
    pub session_id: String,
    pub reasoning_id: Option<String>,
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Runtime-reported session failure
    Session,
    /// Input rejected before reaching the runtime
    Validation,
    /// Call into the runtime failed
    Runtime,
    /// Recognised event with an unusable payload
    MalformedEvent,
    /// Plan workflow misuse
    PlanWorkflow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub session_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, session_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            kind,
            message: message.into(),
        }
    }
}

/// Status transitions shown by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusEvent {
    Thinking { session_id: String },
    Ready { session_id: String },
    AuthenticationRequired { message: String },
    SessionExpired { session_id: String },
    PlanModeEnabled { session_id: String },
    PlanModeDisabled { session_id: String },
    PlanReady { summary: String },
    PlanAccepted { summary: Option<String> },
    PlanRejected { summary: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUpdate {
    pub tool_call_id: String,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileChanged {
    pub path: PathBuf,
    pub tool_call_id: Option<String>,
    /// Known only when the change was attributed to a snapshotted tool call
    pub existed_before: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffAvailable {
    pub tool_call_id: String,
    pub path: PathBuf,
    /// Snapshot artifact holding the "before" content (empty for new files)
    pub before_path: PathBuf,
    pub existed_before: bool,
    pub diff: DiffSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UsageUpdate {
    Turn {
        session_id: String,
        model: Option<String>,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: Option<u64>,
    },
    Context {
        session_id: String,
        current_tokens: u64,
        token_limit: u64,
    },
}

/// The fixed set of output channels exposed to the presentation layer.
pub struct CoreChannels {
    pub output: Channel<OutputChunk>,
    pub reasoning: Channel<ReasoningChunk>,
    pub error: Channel<ErrorEvent>,
    pub status: Channel<StatusEvent>,
    pub tool_start: Channel<ToolExecutionState>,
    pub tool_update: Channel<ToolUpdate>,
    pub tool_complete: Channel<ToolExecutionState>,
    pub file_changed: Channel<FileChanged>,
    pub diff_available: Channel<DiffAvailable>,
    pub usage: Channel<UsageUpdate>,
}

impl CoreChannels {
    pub fn new() -> Self {
        Self {
            output: Channel::new("output"),
            reasoning: Channel::new("reasoning"),
            error: Channel::new("error"),
            status: Channel::new("status"),
            tool_start: Channel::new("tool_start"),
            tool_update: Channel::new("tool_update"),
            tool_complete: Channel::new("tool_complete"),
            file_changed: Channel::new("file_changed"),
            diff_available: Channel::new("diff_available"),
            usage: Channel::new("usage"),
        }
    }

    pub(crate) fn report(
        &self,
        kind: ErrorKind,
        session_id: Option<&str>,
        message: impl Into<String>,
    ) {
        let event = ErrorEvent::new(kind, session_id, message);
        warn!(kind = ?event.kind, session = ?event.session_id, "{}", event.message);
        self.error.emit(event);
    }

    /// Channels still waiting for their subscriber.
    pub fn unsubscribed(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut check = |subscribed: bool, name: &'static str| {
            if !subscribed {
                names.push(name);
            }
        };
        check(self.output.is_subscribed(), self.output.name());
        check(self.reasoning.is_subscribed(), self.reasoning.name());
        check(self.error.is_subscribed(), self.error.name());
        check(self.status.is_subscribed(), self.status.name());
        check(self.tool_start.is_subscribed(), self.tool_start.name());
        check(self.tool_update.is_subscribed(), self.tool_update.name());
        check(self.tool_complete.is_subscribed(), self.tool_complete.name());
        check(self.file_changed.is_subscribed(), self.file_changed.name());
        check(self.diff_available.is_subscribed(), self.diff_available.name());
        check(self.usage.is_subscribed(), self.usage.name());
        names
    }
}

impl Default for CoreChannels {
    fn default() -> Self {
        Self::new()
    }
}
