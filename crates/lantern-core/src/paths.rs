//! Centralized path utilities
//!
//! All application paths in one place for consistency

use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = ".lantern";

/// Get the lantern config directory (~/.lantern)
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Get the default config file (~/.lantern/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the logs directory (~/.lantern/logs)
pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Get the session-state root (~/.lantern/session-state)
pub fn session_state_dir() -> PathBuf {
    config_dir().join("session-state")
}

/// Directory holding the durable state of one session
pub fn session_dir(state_root: &Path, session_id: &str) -> PathBuf {
    state_root.join(sanitize_component(session_id))
}

/// Plan document for a plan-capable session
pub fn plan_document(state_root: &Path, session_id: &str) -> PathBuf {
    session_dir(state_root, session_id).join("plan.md")
}

/// Append-only event log for a session
pub fn event_log(state_root: &Path, session_id: &str) -> PathBuf {
    session_dir(state_root, session_id).join("events.jsonl")
}

/// Make an opaque identifier safe to use as a single path component.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}
