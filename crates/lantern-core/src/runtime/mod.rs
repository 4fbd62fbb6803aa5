//! Agent runtime seam
//!
//! The core drives an external conversational agent runtime through two
//! traits: `AgentRuntime` creates or resumes sessions, and `RuntimeSession`
//! is the handle to one of them. Each handle yields its raw event stream
//! exactly once; the session controller owns that stream from then on.

pub mod scripted;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{AttachmentConfig, McpServerConfig};
use crate::error::RuntimeError;
use crate::events::RawEnvelope;
use crate::tools::Tool;

pub use scripted::{ScriptedRuntime, ScriptedSession};

/// Ordered raw event stream of one session.
pub type RawEventReceiver = mpsc::UnboundedReceiver<RawEnvelope>;

/// Logical role of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// Full capability implementation context
    Work,
    /// Restricted planning context
    Plan,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Work => write!(f, "work"),
            SessionRole::Plan => write!(f, "plan"),
        }
    }
}

/// Parameters for creating or resuming a session.
#[derive(Clone)]
pub struct SessionConfig {
    pub role: SessionRole,
    pub working_dir: PathBuf,
    pub model: Option<String>,
    /// Custom tool handlers registered with the runtime
    pub tools: Vec<Arc<dyn Tool>>,
    /// Capability whitelist; `None` leaves the runtime's built-in set untouched
    pub available_tools: Option<Vec<String>>,
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl SessionConfig {
    pub fn new(role: SessionRole, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            working_dir: working_dir.into(),
            model: None,
            tools: Vec::new(),
            available_tools: None,
            mcp_servers: HashMap::new(),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("role", &self.role)
            .field("working_dir", &self.working_dir)
            .field("model", &self.model)
            .field("tools", &self.tool_names())
            .field("available_tools", &self.available_tools)
            .field("mcp_servers", &self.mcp_servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    File,
    Directory,
    Image,
}

/// A file-system reference sent alongside a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub kind: AttachmentKind,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Attachment {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: AttachmentKind::File,
            display_name: None,
        }
    }

    pub fn image(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: AttachmentKind::Image,
            display_name: None,
        }
    }

    /// Check the attachment against what the active model accepts.
    pub fn validate(&self, config: &AttachmentConfig) -> Result<(), String> {
        if self.kind == AttachmentKind::Image && !config.vision_enabled {
            return Err(format!(
                "Image attachment '{}' is not supported by the active model",
                self.path.display()
            ));
        }

        let metadata = std::fs::metadata(&self.path)
            .map_err(|e| format!("Attachment '{}' is not readable: {}", self.path.display(), e))?;

        match self.kind {
            AttachmentKind::Directory if !metadata.is_dir() => Err(format!(
                "Attachment '{}' is not a directory",
                self.path.display()
            )),
            AttachmentKind::File | AttachmentKind::Image if !metadata.is_file() => Err(format!(
                "Attachment '{}' is not a file",
                self.path.display()
            )),
            AttachmentKind::File | AttachmentKind::Image if metadata.len() > config.max_bytes => {
                Err(format!(
                    "Attachment '{}' is {} bytes, limit is {}",
                    self.path.display(),
                    metadata.len(),
                    config.max_bytes
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A user message plus attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Handle to one live runtime session.
#[async_trait]
pub trait RuntimeSession: Send + Sync {
    /// Runtime-assigned identifier
    fn id(&self) -> &str;

    /// Take the ordered raw event stream. Returns `None` once taken.
    fn take_events(&self) -> Option<RawEventReceiver>;

    /// Send a user prompt
    async fn send(&self, prompt: Prompt) -> Result<(), RuntimeError>;

    /// Abort the current turn
    async fn abort(&self) -> Result<(), RuntimeError>;

    /// Release the handle. Durable session state is kept by the runtime.
    async fn destroy(&self) -> Result<(), RuntimeError>;
}

/// The external agent runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<dyn RuntimeSession>, RuntimeError>;

    async fn resume_session(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Arc<dyn RuntimeSession>, RuntimeError>;
}
