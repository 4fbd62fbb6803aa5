//! Error types for the session core
//!
//! Runtime-reported conditions never cross the public boundary as errors on
//! their own; they are turned into channel events first. These types cover
//! setup failures, caller contract violations, and the internal results the
//! controller maps onto channels.

use std::path::PathBuf;

use thiserror::Error;

use crate::plan::workflow::PlanPhase;

/// Errors surfaced by the agent runtime collaborator.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} expired")]
    SessionExpired { session_id: String },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("runtime connection closed")]
    Closed,
}

impl RuntimeError {
    /// Resume failures that should fall back to a fresh session.
    pub fn is_resume_miss(&self) -> bool {
        matches!(
            self,
            RuntimeError::SessionNotFound { .. } | RuntimeError::SessionExpired { .. }
        )
    }
}

/// Snapshot capture failures. These degrade to "no diff available".
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write snapshot for {path} to {temp_path}: {source}")]
    Write {
        path: PathBuf,
        temp_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot store has been disposed")]
    Disposed,
}

/// Invalid plan-workflow transitions.
#[derive(Debug, Clone, Error)]
pub enum PlanWorkflowError {
    #[error("cannot {action} while plan is {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: PlanPhase,
    },

    #[error("plan mode is not active")]
    NotInPlanMode,
}

/// Errors returned from the public operations of the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to prepare temporary storage at {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("the session core has been disposed")]
    Disposed,

    #[error("no work session has been started")]
    NoWorkSession,

    #[error("channel '{channel}' already has a subscriber")]
    AlreadySubscribed { channel: &'static str },

    #[error("no session is available: {0}")]
    SessionUnavailable(String),

    #[error("invalid message: {0}")]
    Validation(String),

    #[error(transparent)]
    PlanWorkflow(#[from] PlanWorkflowError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl CoreError {
    #[must_use]
    pub fn setup(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Setup {
            path: path.into(),
            source,
        }
    }
}
