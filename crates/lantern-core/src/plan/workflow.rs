//! Plan workflow state machine
//!
//! `planning -> presented -> {accepted | rejected}`. Shared between the
//! session controller and the `present_plan` tool; every successful
//! transition is announced on the status channel. A decision ends plan mode,
//! so the next cycle starts with a fresh workflow on the next entry.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::channels::{CoreChannels, StatusEvent};
use crate::error::PlanWorkflowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanPhase {
    Planning,
    Presented,
    Accepted,
    Rejected,
}

impl fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlanPhase::Planning => "planning",
            PlanPhase::Presented => "presented",
            PlanPhase::Accepted => "accepted",
            PlanPhase::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
struct WorkflowState {
    phase: PlanPhase,
    summary: Option<String>,
}

pub struct PlanWorkflow {
    state: Mutex<WorkflowState>,
    channels: Arc<CoreChannels>,
}

impl PlanWorkflow {
    pub fn new(channels: Arc<CoreChannels>) -> Self {
        Self {
            state: Mutex::new(WorkflowState {
                phase: PlanPhase::Planning,
                summary: None,
            }),
            channels,
        }
    }

    pub fn phase(&self) -> PlanPhase {
        self.state.lock().phase
    }

    pub fn summary(&self) -> Option<String> {
        self.state.lock().summary.clone()
    }

    /// Surface the plan for review. Presenting again while already presented
    /// replaces the summary.
    pub fn present(&self, summary: &str) -> Result<(), PlanWorkflowError> {
        {
            let mut state = self.state.lock();
            match state.phase {
                PlanPhase::Planning | PlanPhase::Presented => {}
                phase => {
                    return Err(PlanWorkflowError::InvalidTransition {
                        action: "present plan",
                        phase,
                    })
                }
            }
            state.phase = PlanPhase::Presented;
            state.summary = Some(summary.to_string());
        }

        info!(summary, "Plan presented");
        self.channels.status.emit(StatusEvent::PlanReady {
            summary: summary.to_string(),
        });
        Ok(())
    }

    pub fn accept(&self) -> Result<Option<String>, PlanWorkflowError> {
        let summary = self.decide(PlanPhase::Accepted, "accept plan")?;
        self.channels.status.emit(StatusEvent::PlanAccepted {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    pub fn reject(&self) -> Result<Option<String>, PlanWorkflowError> {
        let summary = self.decide(PlanPhase::Rejected, "reject plan")?;
        self.channels.status.emit(StatusEvent::PlanRejected {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    fn decide(
        &self,
        next: PlanPhase,
        action: &'static str,
    ) -> Result<Option<String>, PlanWorkflowError> {
        let mut state = self.state.lock();
        if state.phase != PlanPhase::Presented {
            return Err(PlanWorkflowError::InvalidTransition {
                action,
                phase: state.phase,
            });
        }
        state.phase = next;
        info!(phase = %next, "Plan decided");
        Ok(state.summary.clone())
    }
}
