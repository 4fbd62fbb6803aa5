//! Core configuration
//!
//! Parsed from `~/.lantern/config.toml`. Every field has a default so an
//! empty or missing file yields a usable configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

const DEFAULT_DIFF_MAX_LINES: usize = 400;
const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Tool names treated as file-mutating unless overridden
pub const DEFAULT_MUTATING_TOOLS: &[&str] = &[
    "edit",
    "create",
    "write",
    "str_replace_editor",
    "str_replace",
    "multiedit",
    "insert",
];

/// Top-level configuration for a session core instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Working directory handed to the runtime for new sessions
    pub working_dir: PathBuf,
    /// Root of the per-session state directories
    pub state_dir: PathBuf,
    /// Model requested for new sessions (runtime default when unset)
    pub model: Option<String>,
    /// Maximum number of records in a computed diff
    pub diff_max_lines: usize,
    /// Tool names whose arguments name files that will be mutated
    pub mutating_tools: Vec<String>,
    pub plan: PlanConfig,
    pub attachments: AttachmentConfig,
    /// MCP servers passed through to the runtime on session creation
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            state_dir: paths::session_state_dir(),
            model: None,
            diff_max_lines: DEFAULT_DIFF_MAX_LINES,
            mutating_tools: DEFAULT_MUTATING_TOOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            plan: PlanConfig::default(),
            attachments: AttachmentConfig::default(),
            mcp_servers: HashMap::new(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_default() -> Result<Self> {
        let path = paths::config_file();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(content).context("Failed to parse TOML")?;
        Ok(config)
    }

    /// Builder-style working directory override
    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// Builder-style session-state root override
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn is_mutating_tool(&self, name: &str) -> bool {
        self.mutating_tools.iter().any(|t| t == name)
    }
}

/// Plan-mode policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Extra allow rules (exact tool names, globs, or `shell(<glob>)`)
    pub allow: Vec<String>,
    /// Directories, relative to the working directory, the plan file gate may write to
    pub writable_dirs: Vec<PathBuf>,
    /// Timeout for read-only shell commands
    pub shell_timeout_secs: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            writable_dirs: vec![PathBuf::from(".lantern/plans")],
            shell_timeout_secs: DEFAULT_SHELL_TIMEOUT_SECS,
        }
    }
}

impl PlanConfig {
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs.max(1))
    }
}

/// Attachment validation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// Whether the configured model accepts image input
    pub vision_enabled: bool,
    /// Largest accepted attachment in bytes
    pub max_bytes: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            vision_enabled: false,
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

/// MCP server passthrough entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    /// Local server spawned by the runtime (stdio transport)
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server reached over HTTP
    Remote {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = CoreConfig::parse("").unwrap();
        assert_eq!(config.diff_max_lines, DEFAULT_DIFF_MAX_LINES);
        assert!(config.is_mutating_tool("edit"));
        assert!(config.is_mutating_tool("create"));
        assert!(!config.is_mutating_tool("view"));
        assert!(!config.attachments.vision_enabled);
        assert_eq!(config.plan.writable_dirs, vec![PathBuf::from(".lantern/plans")]);
    }

    #[test]
    fn parses_nested_sections() {
        let config = CoreConfig::parse(
            r#"
            diff_max_lines = 50
            mutating_tools = ["apply"]

            [plan]
            allow = ["shell(cargo metadata*)", "fetch_*"]
            shell_timeout_secs = 5

            [attachments]
            vision_enabled = true

            [mcp_servers.hello]
            command = "python"
            args = ["server.py"]

            [mcp_servers.remote]
            url = "https://example.com/mcp"
            "#,
        )
        .unwrap();

        assert_eq!(config.diff_max_lines, 50);
        assert!(config.is_mutating_tool("apply"));
        assert!(!config.is_mutating_tool("edit"));
        assert_eq!(config.plan.allow.len(), 2);
        assert_eq!(config.plan.shell_timeout(), Duration::from_secs(5));
        assert!(config.attachments.vision_enabled);
        assert!(matches!(
            config.mcp_servers.get("hello"),
            Some(McpServerConfig::Local { command, .. }) if command == "python"
        ));
        assert!(matches!(
            config.mcp_servers.get("remote"),
            Some(McpServerConfig::Remote { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoreConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
