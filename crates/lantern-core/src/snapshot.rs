//! Before-state snapshots of files a tool call may mutate
//!
//! Every capture writes a real artifact under a private temporary root, one
//! subdirectory per session. A file that did not exist yet is captured as an
//! empty artifact so the "before" side of a diff is always a readable path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{CoreError, SnapshotError};
use crate::paths;

/// Captured before-state of one file for one tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSnapshot {
    pub tool_call_id: String,
    pub session_id: String,
    pub original_path: PathBuf,
    /// Artifact holding the captured bytes (empty when the file was absent)
    pub temp_path: PathBuf,
    pub existed_before: bool,
    pub captured_at: DateTime<Utc>,
}

type SnapshotKey = (String, PathBuf);

pub struct SnapshotStore {
    root: Mutex<Option<TempDir>>,
    root_path: PathBuf,
    entries: DashMap<SnapshotKey, FileSnapshot>,
}

impl SnapshotStore {
    /// Create a store rooted in a fresh directory under the system temp dir.
    pub fn new() -> Result<Self, CoreError> {
        let base = std::env::temp_dir();
        let dir = tempfile::Builder::new()
            .prefix("lantern-snapshots-")
            .tempdir_in(&base)
            .map_err(|e| CoreError::setup(&base, e))?;
        Ok(Self::from_dir(dir))
    }

    /// Create a store rooted under `base`.
    pub fn new_in(base: &Path) -> Result<Self, CoreError> {
        std::fs::create_dir_all(base).map_err(|e| CoreError::setup(base, e))?;
        let dir = tempfile::Builder::new()
            .prefix("lantern-snapshots-")
            .tempdir_in(base)
            .map_err(|e| CoreError::setup(base, e))?;
        Ok(Self::from_dir(dir))
    }

    fn from_dir(dir: TempDir) -> Self {
        let root_path = dir.path().to_path_buf();
        debug!(root = %root_path.display(), "Snapshot store ready");
        Self {
            root: Mutex::new(Some(dir)),
            root_path,
            entries: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    pub fn is_disposed(&self) -> bool {
        self.root.lock().is_none()
    }

    /// Capture the current content of `path` for `tool_call_id`.
    ///
    /// Idempotent per (call id, path): a second capture returns the first one
    /// untouched, so a late fallback can never overwrite an early capture.
    pub async fn capture(
        &self,
        session_id: &str,
        tool_call_id: &str,
        path: &Path,
    ) -> Result<FileSnapshot, SnapshotError> {
        if self.is_disposed() {
            return Err(SnapshotError::Disposed);
        }

        let key = (tool_call_id.to_string(), path.to_path_buf());
        if let Some(existing) = self.entries.get(&key) {
            return Ok(existing.clone());
        }

        let (bytes, existed_before) = match tokio::fs::read(path).await {
            Ok(bytes) => (bytes, true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), false),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let session_dir = self.root_path.join(paths::sanitize_component(session_id));
        let file_name = path
            .file_name()
            .map(|n| paths::sanitize_component(&n.to_string_lossy()))
            .unwrap_or_else(|| "file".to_string());
        let temp_path = session_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), file_name));

        let write = async {
            tokio::fs::create_dir_all(&session_dir).await?;
            tokio::fs::write(&temp_path, &bytes).await
        };
        if let Err(source) = write.await {
            return Err(SnapshotError::Write {
                path: path.to_path_buf(),
                temp_path,
                source,
            });
        }

        let snapshot = FileSnapshot {
            tool_call_id: tool_call_id.to_string(),
            session_id: session_id.to_string(),
            original_path: path.to_path_buf(),
            temp_path,
            existed_before,
            captured_at: Utc::now(),
        };

        debug!(
            tool_call_id,
            path = %path.display(),
            existed_before,
            bytes = bytes.len(),
            "Captured snapshot"
        );

        Ok(self.entries.entry(key).or_insert(snapshot).clone())
    }

    pub fn get(&self, tool_call_id: &str, path: &Path) -> Option<FileSnapshot> {
        self.entries
            .get(&(tool_call_id.to_string(), path.to_path_buf()))
            .map(|s| s.clone())
    }

    /// All snapshots captured for one call, ordered by path.
    pub fn for_call(&self, tool_call_id: &str) -> Vec<FileSnapshot> {
        let mut snapshots: Vec<FileSnapshot> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == tool_call_id)
            .map(|e| e.value().clone())
            .collect();
        snapshots.sort_by(|a, b| a.original_path.cmp(&b.original_path));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delete every artifact captured for `session_id`. Returns how many
    /// snapshots were released.
    pub async fn release_all(&self, session_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, s| s.session_id != session_id);
        let released = before.saturating_sub(self.entries.len());

        let session_dir = self.root_path.join(paths::sanitize_component(session_id));
        match tokio::fs::remove_dir_all(&session_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                session = session_id,
                dir = %session_dir.display(),
                "Failed to remove snapshot directory: {}",
                e
            ),
        }

        if released > 0 {
            debug!(session = session_id, released, "Released snapshots");
        }
        released
    }

    /// Remove the whole temporary root. Later captures fail with `Disposed`.
    pub fn dispose(&self) {
        self.entries.clear();
        if let Some(dir) = self.root.lock().take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(root = %path.display(), "Failed to remove snapshot root: {}", e);
            }
        }
    }
}
