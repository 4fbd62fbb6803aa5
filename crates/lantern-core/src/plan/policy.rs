//! Plan-mode capability policy
//!
//! Builds the capability whitelist handed to the runtime for plan sessions
//! and answers the checks each plan tool repeats for itself: is this shell
//! command read-only, is this path inside a writable plan directory, is this
//! tool allowed at all.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use tracing::warn;

use crate::config::PlanConfig;
use crate::plan::tools::CUSTOM_TOOL_NAMES;
use crate::tools::{classify_command_with, ShellVerdict, ToolContext};

/// Runtime built-ins that never mutate the workspace
pub const READ_ONLY_BUILTINS: &[&str] = &["view", "read", "grep", "glob", "list", "web_fetch"];

const SHELL_PREFIX: &str = "shell(";

#[derive(Debug, Clone)]
enum ToolRule {
    Exact(String),
    Glob(Pattern),
}

impl ToolRule {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            ToolRule::Exact(name) => name == candidate,
            ToolRule::Glob(pattern) => pattern.matches(candidate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellDecision {
    Allowed,
    Denied { reason: String },
}

impl ShellDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ShellDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
pub struct PlanPolicy {
    working_dir: PathBuf,
    writable_dirs: Vec<PathBuf>,
    tool_rules: Vec<ToolRule>,
    shell_rules: Vec<Pattern>,
    shell_timeout: Duration,
}

impl PlanPolicy {
    pub fn new(config: &PlanConfig, working_dir: &Path) -> Self {
        let mut tool_rules = Vec::new();
        let mut shell_rules = Vec::new();
        let mut seen = HashSet::new();

        for entry in &config.allow {
            let entry = entry.trim();
            if entry.is_empty() || !seen.insert(entry.to_string()) {
                continue;
            }

            if let Some(rest) = entry.strip_prefix(SHELL_PREFIX) {
                match rest.strip_suffix(')').map(str::trim) {
                    Some(glob) if !glob.is_empty() => match Pattern::new(glob) {
                        Ok(pattern) => shell_rules.push(pattern),
                        Err(e) => warn!(rule = entry, "Ignoring invalid shell allow rule: {}", e),
                    },
                    _ => warn!(rule = entry, "Ignoring malformed shell() allow rule"),
                }
                continue;
            }

            if is_wildcard(entry) {
                match Pattern::new(entry) {
                    Ok(pattern) => tool_rules.push(ToolRule::Glob(pattern)),
                    Err(e) => warn!(rule = entry, "Ignoring invalid tool allow rule: {}", e),
                }
            } else {
                tool_rules.push(ToolRule::Exact(entry.to_string()));
            }
        }

        let writable_dirs = config
            .writable_dirs
            .iter()
            .map(|dir| {
                if dir.is_absolute() {
                    dir.clone()
                } else {
                    working_dir.join(dir)
                }
            })
            .collect();

        Self {
            working_dir: working_dir.to_path_buf(),
            writable_dirs,
            tool_rules,
            shell_rules,
            shell_timeout: config.shell_timeout(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn writable_dirs(&self) -> &[PathBuf] {
        &self.writable_dirs
    }

    pub fn shell_timeout(&self) -> Duration {
        self.shell_timeout
    }

    /// Whitelist for the plan session: read-only built-ins, the plan tools,
    /// then configured exact names. Glob rules cannot be expressed as names
    /// and are only enforced through `allows_tool`.
    pub fn available_tools(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        READ_ONLY_BUILTINS
            .iter()
            .chain(CUSTOM_TOOL_NAMES.iter())
            .map(|s| s.to_string())
            .chain(self.tool_rules.iter().filter_map(|rule| match rule {
                ToolRule::Exact(name) => Some(name.clone()),
                ToolRule::Glob(_) => None,
            }))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        READ_ONLY_BUILTINS.contains(&name)
            || CUSTOM_TOOL_NAMES.contains(&name)
            || self.tool_rules.iter().any(|rule| rule.matches(name))
    }

    /// Refused constructs never run. Every other segment of the command must
    /// be read-only or match a `shell(<glob>)` rule.
    pub fn check_shell(&self, command: &str) -> ShellDecision {
        let command = command.trim();
        if command.is_empty() {
            return ShellDecision::Denied {
                reason: "empty command".to_string(),
            };
        }

        match classify_command_with(command, |segment| self.matches_shell_rule(segment)) {
            ShellVerdict::ReadOnly => ShellDecision::Allowed,
            ShellVerdict::Refused { reason } => ShellDecision::Denied {
                reason: format!("refused: {}", reason),
            },
            ShellVerdict::Mutating { segment } => ShellDecision::Denied {
                reason: format!("'{}' is not known to be read-only", segment),
            },
        }
    }

    fn matches_shell_rule(&self, segment: &str) -> bool {
        self.shell_rules.iter().any(|rule| rule.matches(segment))
    }

    /// Resolve `path` and require it to land inside a writable plan directory.
    pub fn check_write_path(&self, ctx: &ToolContext, path: &str) -> Result<PathBuf, String> {
        if self.writable_dirs.is_empty() {
            return Err("No writable plan directories are configured".to_string());
        }

        let mut last_err = String::new();
        for root in &self.writable_dirs {
            match ctx.resolve_new_path_within(path, root) {
                Ok(resolved) => return Ok(resolved),
                Err(e) if e.contains("traversal") => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(format!(
            "{} (plan files may only be written under: {})",
            last_err,
            self.writable_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

fn is_wildcard(entry: &str) -> bool {
    entry.contains('*') || entry.contains('?') || entry.contains('[')
}
