//! Plan document with an entry checkpoint

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Checkpoint {
    Absent,
    Content(Vec<u8>),
}

/// The plan file of one work session. Only the `update_plan` tool writes it.
pub struct PlanDocument {
    path: PathBuf,
    checkpoint: Mutex<Option<Checkpoint>>,
}

impl PlanDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            checkpoint: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remember the current content so `restore` can roll back to it.
    pub async fn checkpoint(&self) -> io::Result<()> {
        let snapshot = match tokio::fs::read(&self.path).await {
            Ok(bytes) => Checkpoint::Content(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Checkpoint::Absent,
            Err(e) => return Err(e),
        };
        debug!(
            path = %self.path.display(),
            existed = matches!(snapshot, Checkpoint::Content(_)),
            "Plan checkpoint taken"
        );
        *self.checkpoint.lock().await = Some(snapshot);
        Ok(())
    }

    /// Roll back to the checkpoint. Returns false when none was taken.
    pub async fn restore(&self) -> io::Result<bool> {
        let Some(checkpoint) = self.checkpoint.lock().await.take() else {
            return Ok(false);
        };

        match checkpoint {
            Checkpoint::Content(bytes) => {
                self.ensure_parent().await?;
                tokio::fs::write(&self.path, bytes).await?;
            }
            Checkpoint::Absent => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            },
        }
        info!(path = %self.path.display(), "Plan document restored");
        Ok(true)
    }

    /// Drop the checkpoint, keeping the current content.
    pub async fn commit(&self) {
        self.checkpoint.lock().await.take();
    }

    pub async fn write(&self, content: &str) -> io::Result<()> {
        self.ensure_parent().await?;
        tokio::fs::write(&self.path, content).await
    }

    pub async fn read(&self) -> io::Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_parent(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restore_brings_back_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let doc = PlanDocument::new(dir.path().join("W1/plan.md"));
        doc.write("# v1").await.unwrap();

        doc.checkpoint().await.unwrap();
        doc.write("# v2").await.unwrap();
        assert!(doc.restore().await.unwrap());
        assert_eq!(doc.read().await.unwrap().as_deref(), Some("# v1"));
    }

    #[tokio::test]
    async fn restore_removes_file_absent_at_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let doc = PlanDocument::new(dir.path().join("W1/plan.md"));

        doc.checkpoint().await.unwrap();
        doc.write("# draft").await.unwrap();
        assert!(doc.restore().await.unwrap());
        assert_eq!(doc.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn commit_discards_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let doc = PlanDocument::new(dir.path().join("plan.md"));
        doc.checkpoint().await.unwrap();
        doc.write("kept").await.unwrap();
        doc.commit().await;
        assert!(!doc.restore().await.unwrap());
        assert_eq!(doc.read().await.unwrap().as_deref(), Some("kept"));
    }
}
