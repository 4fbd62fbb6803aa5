//! Tool execution tracking
//!
//! Every tool call gets a `ToolExecutionState` keyed globally by its call id,
//! so terminal events that arrive after a session switch still land on the
//! right record. File-mutating calls get before-snapshots as soon as the call
//! is known, and a bounded diff once it completes.

pub mod diff;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::channels::{CoreChannels, DiffAvailable, FileChanged, ToolUpdate};
use crate::events::{FileChange, ToolComplete, ToolProgress, ToolRequest, ToolStart};
use crate::snapshot::SnapshotStore;
use self::diff::{compute_diff, DiffSummary};

/// Tool name recorded for calls first seen at completion
pub const UNKNOWN_TOOL: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    /// Announced by the assistant, not started yet
    Pending,
    Running,
    Complete,
    Failed,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::Complete | ToolStatus::Failed)
    }
}

/// Diff produced for one file touched by a call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiff {
    pub path: PathBuf,
    pub diff: DiffSummary,
}

/// One tool invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolExecutionState {
    pub tool_call_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolStatus,
    pub intent: Option<String>,
    pub progress: Option<String>,
    pub requested_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub diffs: Vec<FileDiff>,
    /// Created from a completion whose start was never observed
    pub synthetic: bool,
    /// Creation order across all sessions
    pub seq: u64,
}

impl ToolExecutionState {
    fn new(tool_call_id: &str, session_id: &str, tool_name: &str, seq: u64) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: Value::Null,
            status: ToolStatus::Pending,
            intent: None,
            progress: None,
            requested_at: None,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            diffs: Vec::new(),
            synthetic: false,
            seq,
        }
    }

    /// Wall-clock duration, once terminal.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Tracks tool calls and drives the tool, file and diff channels.
pub struct ToolExecutionTracker {
    states: DashMap<String, ToolExecutionState>,
    snapshots: Arc<SnapshotStore>,
    channels: Arc<CoreChannels>,
    mutating_tools: HashSet<String>,
    /// Raw changes held back until the owning mutating call completes
    deferred_changes: DashMap<String, Vec<PathBuf>>,
    diff_max_lines: usize,
    next_seq: AtomicU64,
}

impl ToolExecutionTracker {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        channels: Arc<CoreChannels>,
        mutating_tools: impl IntoIterator<Item = String>,
        diff_max_lines: usize,
    ) -> Self {
        Self {
            states: DashMap::new(),
            snapshots,
            channels,
            mutating_tools: mutating_tools.into_iter().collect(),
            deferred_changes: DashMap::new(),
            diff_max_lines,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn is_mutating(&self, tool_name: &str) -> bool {
        self.mutating_tools.contains(tool_name)
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// A tool call announced by an assistant message. Snapshots are taken
    /// here, before the runtime gets a chance to run the call.
    pub async fn on_requested(&self, session_id: &str, working_dir: &Path, request: &ToolRequest) {
        if self.states.contains_key(&request.tool_call_id) {
            debug!(tool_call_id = %request.tool_call_id, "Tool request already tracked");
            return;
        }

        let mut state =
            ToolExecutionState::new(&request.tool_call_id, session_id, &request.name, self.seq());
        state.arguments = normalize_arguments(&request.arguments);
        state.requested_at = Some(Utc::now());

        if self.is_mutating(&request.name) {
            self.capture_snapshots(session_id, working_dir, &state).await;
        }

        debug!(
            tool_call_id = %request.tool_call_id,
            tool = %request.name,
            session = session_id,
            "Tool requested"
        );
        self.states.insert(request.tool_call_id.clone(), state);
    }

    pub async fn on_start(&self, session_id: &str, working_dir: &Path, start: ToolStart) {
        let existing = self.get(&start.tool_call_id);
        let mut state = match existing {
            Some(state) if state.status != ToolStatus::Pending => {
                warn!(
                    tool_call_id = %start.tool_call_id,
                    status = ?state.status,
                    "Duplicate tool start dropped"
                );
                return;
            }
            Some(state) => state,
            None => ToolExecutionState::new(
                &start.tool_call_id,
                session_id,
                &start.tool_name,
                self.seq(),
            ),
        };

        state.tool_name = start.tool_name;
        let arguments = normalize_arguments(&start.arguments);
        if !arguments.is_null() {
            state.arguments = arguments;
        }
        state.intent = start.intent.or(state.intent);
        state.status = ToolStatus::Running;
        state.started_at = Some(Utc::now());

        // Fallback capture point; paths captured on request are kept as-is
        if self.is_mutating(&state.tool_name) {
            self.capture_snapshots(session_id, working_dir, &state).await;
        }

        debug!(
            tool_call_id = %state.tool_call_id,
            tool = %state.tool_name,
            session = %state.session_id,
            "Tool started"
        );
        self.states
            .insert(state.tool_call_id.clone(), state.clone());
        self.channels.tool_start.emit(state);
    }

    pub fn on_progress(&self, progress: ToolProgress) {
        let session_id = {
            let Some(mut state) = self.states.get_mut(&progress.tool_call_id) else {
                warn!(tool_call_id = %progress.tool_call_id, "Progress for unknown tool call dropped");
                return;
            };
            if state.status.is_terminal() {
                warn!(tool_call_id = %progress.tool_call_id, "Progress after completion dropped");
                return;
            }
            state.progress = Some(progress.progress_message.clone());
            state.session_id.clone()
        };

        self.channels.tool_update.emit(ToolUpdate {
            tool_call_id: progress.tool_call_id,
            session_id,
            message: progress.progress_message,
        });
    }

    pub async fn on_complete(&self, session_id: &str, complete: ToolComplete) {
        let mut state = match self.get(&complete.tool_call_id) {
            Some(state) if state.status.is_terminal() => {
                warn!(
                    tool_call_id = %complete.tool_call_id,
                    status = ?state.status,
                    "Duplicate tool completion dropped"
                );
                return;
            }
            Some(state) => state,
            None => {
                debug!(
                    tool_call_id = %complete.tool_call_id,
                    "Completion for untracked tool call, synthesizing start"
                );
                let mut state = ToolExecutionState::new(
                    &complete.tool_call_id,
                    session_id,
                    UNKNOWN_TOOL,
                    self.seq(),
                );
                state.synthetic = true;
                state
            }
        };

        // Start always precedes completion on the channels
        if state.status == ToolStatus::Pending {
            state.status = ToolStatus::Running;
            state.started_at = Some(Utc::now());
            self.channels.tool_start.emit(state.clone());
        }

        state.ended_at = Some(Utc::now());
        if complete.success {
            state.status = ToolStatus::Complete;
            state.result = complete.result.clone();
        } else {
            state.status = ToolStatus::Failed;
            state.error = Some(
                complete
                    .error_message()
                    .unwrap_or_else(|| "Tool execution failed".to_string()),
            );
        }

        // Failed calls report no file changes
        let mut reports = Vec::new();
        if complete.success && self.is_mutating(&state.tool_name) {
            for snapshot in self.snapshots.for_call(&state.tool_call_id) {
                let diff = self
                    .diff_snapshot(&snapshot.temp_path, &snapshot.original_path)
                    .await;
                if let Some(diff) = &diff {
                    state.diffs.push(FileDiff {
                        path: snapshot.original_path.clone(),
                        diff: diff.clone(),
                    });
                }
                reports.push((snapshot, diff));
            }
        }

        debug!(
            tool_call_id = %state.tool_call_id,
            tool = %state.tool_name,
            status = ?state.status,
            duration_ms = state.duration_ms(),
            "Tool finished"
        );
        self.states
            .insert(state.tool_call_id.clone(), state.clone());
        self.channels.tool_complete.emit(state.clone());

        // Raw changes no snapshot accounts for, including every change of a
        // failed call, are still reported
        let deferred = self
            .deferred_changes
            .remove(&state.tool_call_id)
            .map(|(_, paths)| paths)
            .unwrap_or_default();
        let unreported: Vec<PathBuf> = deferred
            .into_iter()
            .filter(|path| !reports.iter().any(|(s, _)| &s.original_path == path))
            .collect();

        for (snapshot, diff) in reports {
            self.channels.file_changed.emit(FileChanged {
                path: snapshot.original_path.clone(),
                tool_call_id: Some(state.tool_call_id.clone()),
                existed_before: Some(snapshot.existed_before),
            });
            if let Some(diff) = diff {
                self.channels.diff_available.emit(DiffAvailable {
                    tool_call_id: state.tool_call_id.clone(),
                    path: snapshot.original_path,
                    before_path: snapshot.temp_path,
                    existed_before: snapshot.existed_before,
                    diff,
                });
            }
        }
        for path in unreported {
            self.channels.file_changed.emit(FileChanged {
                path,
                tool_call_id: Some(state.tool_call_id.clone()),
                existed_before: None,
            });
        }
    }

    /// A raw file-change notification. While a mutating call is in flight
    /// its changes wait for the completion, which reports snapshotted paths
    /// with their diff and forwards the rest.
    pub fn on_file_changed(&self, working_dir: &Path, change: FileChange) {
        let path = resolve(working_dir, &change.path);

        if let Some(id) = &change.tool_call_id {
            if let Some(state) = self.states.get(id) {
                if self.is_mutating(&state.tool_name) {
                    match state.status {
                        ToolStatus::Pending | ToolStatus::Running => {
                            debug!(tool_call_id = %id, path = %path.display(), "File change deferred to completion");
                            self.deferred_changes
                                .entry(id.clone())
                                .or_default()
                                .push(path);
                            return;
                        }
                        ToolStatus::Complete if self.snapshots.get(id, &path).is_some() => {
                            debug!(tool_call_id = %id, path = %path.display(), "File change already reported");
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }

        self.channels.file_changed.emit(FileChanged {
            path,
            tool_call_id: change.tool_call_id,
            existed_before: None,
        });
    }

    pub fn get(&self, tool_call_id: &str) -> Option<ToolExecutionState> {
        self.states.get(tool_call_id).map(|s| s.clone())
    }

    /// All calls of one session in creation order.
    pub fn list_for_session(&self, session_id: &str) -> Vec<ToolExecutionState> {
        let mut states: Vec<ToolExecutionState> = self
            .states
            .iter()
            .filter(|s| s.session_id == session_id)
            .map(|s| s.value().clone())
            .collect();
        states.sort_by_key(|s| s.seq);
        states
    }

    /// Forget every call of one session. Returns how many were removed.
    pub fn clear_session(&self, session_id: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|_, s| s.session_id != session_id);
        self.deferred_changes
            .retain(|id, _| self.states.contains_key(id));
        before.saturating_sub(self.states.len())
    }

    pub fn clear(&self) {
        self.states.clear();
        self.deferred_changes.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    async fn capture_snapshots(
        &self,
        session_id: &str,
        working_dir: &Path,
        state: &ToolExecutionState,
    ) {
        for path in extract_paths(&state.arguments, working_dir) {
            if let Err(e) = self
                .snapshots
                .capture(session_id, &state.tool_call_id, &path)
                .await
            {
                warn!(
                    tool_call_id = %state.tool_call_id,
                    path = %path.display(),
                    "Snapshot capture failed, no diff will be available: {}",
                    e
                );
            }
        }
    }

    async fn diff_snapshot(&self, before_path: &Path, path: &Path) -> Option<DiffSummary> {
        let before = match tokio::fs::read(before_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), "Snapshot unreadable, skipping diff: {}", e);
                return None;
            }
        };
        let after = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), "File unreadable, skipping diff: {}", e);
                return None;
            }
        };

        let diff = compute_diff(&before, &after, self.diff_max_lines);
        if diff.is_none() {
            debug!(path = %path.display(), "Binary content, no diff");
        }
        diff
    }
}

/// Arguments sometimes arrive JSON-encoded as a string.
fn normalize_arguments(arguments: &Value) -> Value {
    match arguments {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| arguments.clone()),
        other => other.clone(),
    }
}

fn resolve(working_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        working_dir.join(path)
    }
}

const PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "target_file"];
const PATH_LIST_KEYS: &[&str] = &["paths", "files"];

/// File paths named in a tool call's arguments, resolved and de-duplicated.
pub fn extract_paths(arguments: &Value, working_dir: &Path) -> Vec<PathBuf> {
    let mut raw = Vec::new();
    collect_paths(arguments, &mut raw);

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| resolve(working_dir, &p))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

fn collect_paths(value: &Value, out: &mut Vec<String>) {
    let Value::Object(map) = value else {
        return;
    };

    for key in PATH_KEYS {
        if let Some(path) = map.get(*key).and_then(Value::as_str) {
            out.push(path.to_string());
        }
    }
    for key in PATH_LIST_KEYS {
        if let Some(items) = map.get(*key).and_then(Value::as_array) {
            for item in items {
                match item {
                    Value::String(path) => out.push(path.clone()),
                    nested @ Value::Object(_) => collect_paths(nested, out),
                    _ => {}
                }
            }
        }
    }
    if let Some(edits) = map.get("edits").and_then(Value::as_array) {
        for edit in edits {
            collect_paths(edit, out);
        }
    }
}
