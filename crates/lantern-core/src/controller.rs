//! Session controller
//!
//! Owns the work and plan sessions, the single active-session pointer, and
//! the plan-mode lifecycle. The active pointer only moves through
//! `switch_active_session`, which re-subscribes the relay in the same step.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::channels::{CoreChannels, ErrorKind, StatusEvent};
use crate::config::CoreConfig;
use crate::error::{CoreError, PlanWorkflowError, RuntimeError};
use crate::plan::{PlanMode, PlanPolicy};
use crate::relay::{EventRelay, SessionFeed};
use crate::runtime::{
    AgentRuntime, Attachment, Prompt, RuntimeSession, SessionConfig, SessionRole,
};
use crate::snapshot::SnapshotStore;
use crate::tracker::{ToolExecutionState, ToolExecutionTracker};

/// Public view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub role: SessionRole,
    pub working_dir: PathBuf,
}

/// How plan mode is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDisposition {
    /// Keep plan document changes
    Accept,
    /// Roll the plan document back to its state at entry
    Reject,
}

struct SessionSlot {
    info: SessionInfo,
    handle: Arc<dyn RuntimeSession>,
    /// Raw stream while the session is not the active one
    parked: Option<SessionFeed>,
}

#[derive(Default)]
struct ControllerState {
    work: Option<SessionSlot>,
    plan: Option<SessionSlot>,
    plan_mode: Option<PlanMode>,
    active: Option<SessionRole>,
    disposed: bool,
}

impl ControllerState {
    fn slot(&self, role: SessionRole) -> Option<&SessionSlot> {
        match role {
            SessionRole::Work => self.work.as_ref(),
            SessionRole::Plan => self.plan.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: SessionRole) -> Option<&mut SessionSlot> {
        match role {
            SessionRole::Work => self.work.as_mut(),
            SessionRole::Plan => self.plan.as_mut(),
        }
    }

    fn active_slot(&self) -> Option<&SessionSlot> {
        self.active.and_then(|role| self.slot(role))
    }
}

pub struct SessionController {
    runtime: Arc<dyn AgentRuntime>,
    config: CoreConfig,
    channels: Arc<CoreChannels>,
    snapshots: Arc<SnapshotStore>,
    tracker: Arc<ToolExecutionTracker>,
    relay: EventRelay,
    state: Mutex<ControllerState>,
}

impl SessionController {
    /// Build a controller. Fails only when temporary snapshot storage cannot
    /// be allocated.
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: CoreConfig) -> Result<Self, CoreError> {
        let snapshots = Arc::new(SnapshotStore::new()?);
        Ok(Self::with_snapshots(runtime, config, snapshots))
    }

    pub fn with_snapshots(
        runtime: Arc<dyn AgentRuntime>,
        config: CoreConfig,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        let channels = Arc::new(CoreChannels::new());
        let tracker = Arc::new(ToolExecutionTracker::new(
            Arc::clone(&snapshots),
            Arc::clone(&channels),
            config.mutating_tools.iter().cloned(),
            config.diff_max_lines,
        ));
        let relay = EventRelay::new(Arc::clone(&channels), Arc::clone(&tracker));

        Self {
            runtime,
            config,
            channels,
            snapshots,
            tracker,
            relay,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// The fixed output channels. Subscribe to each once.
    pub fn channels(&self) -> &CoreChannels {
        &self.channels
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Create or resume the work session and make it active.
    pub async fn start(&self, resume_id: Option<&str>) -> Result<SessionInfo, CoreError> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        if let Some(work) = &state.work {
            return Ok(work.info.clone());
        }

        let config = self.session_config(SessionRole::Work);
        let handle = match resume_id {
            Some(id) => match self.runtime.resume_session(id, config.clone()).await {
                Ok(handle) => {
                    info!(session = id, "Resumed work session");
                    handle
                }
                Err(e) if e.is_resume_miss() => {
                    info!(session = id, "Resume failed ({}), creating a new session", e);
                    self.channels.status.emit(StatusEvent::SessionExpired {
                        session_id: id.to_string(),
                    });
                    self.create_session(config).await?
                }
                Err(e) => return Err(self.runtime_failure(Some(id), e)),
            },
            None => self.create_session(config).await?,
        };

        let slot = self.open_slot(handle, SessionRole::Work, None).await?;
        let info = slot.info.clone();
        state.work = Some(slot);
        self.switch_active_session(&mut state, SessionRole::Work)
            .await?;

        info!(session = %info.id, working_dir = %info.working_dir.display(), "Work session ready");
        let idle = self.channels.unsubscribed();
        if !idle.is_empty() {
            warn!(channels = ?idle, "Started before every channel has a subscriber, their events queue");
        }
        self.channels.status.emit(StatusEvent::Ready {
            session_id: info.id.clone(),
        });
        Ok(info)
    }

    /// Create the restricted plan session and make it active. On failure the
    /// work session stays active and the error is reported on the error
    /// channel as well as returned.
    pub async fn enter_plan_mode(&self) -> Result<SessionInfo, CoreError> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        let Some(work) = &state.work else {
            return Err(self.report(ErrorKind::Session, None, CoreError::NoWorkSession));
        };
        if let Some(plan) = &state.plan {
            return Ok(plan.info.clone());
        }

        let work_id = work.info.id.clone();
        let working_dir = work.info.working_dir.clone();
        let mode = PlanMode::new(
            &self.config,
            &working_dir,
            &work_id,
            Arc::clone(&self.channels),
        );

        if let Err(e) = mode.document.checkpoint().await {
            return Err(self.report(
                ErrorKind::PlanWorkflow,
                Some(&work_id),
                CoreError::setup(mode.document.path(), e),
            ));
        }

        let mut config = self.session_config(SessionRole::Plan);
        config.tools = mode.tools();
        config.available_tools = Some(mode.available_tools());

        let handle = self.create_session(config).await?;
        let slot = self
            .open_slot(handle, SessionRole::Plan, Some(Arc::clone(&mode.policy)))
            .await?;
        let info = slot.info.clone();
        state.plan = Some(slot);
        state.plan_mode = Some(mode);
        self.switch_active_session(&mut state, SessionRole::Plan)
            .await?;

        info!(plan = %info.id, work = %work_id, "Entered plan mode");
        self.channels.status.emit(StatusEvent::PlanModeEnabled {
            session_id: info.id.clone(),
        });
        Ok(info)
    }

    /// Return to the work session. Always announces `plan_mode_disabled`.
    pub async fn exit_plan_mode(&self, disposition: PlanDisposition) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        self.leave_plan_mode(&mut state, disposition).await
    }

    /// Mark the plan ready for review.
    pub async fn present_plan(&self, summary: &str) -> Result<(), CoreError> {
        let state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        let result = match &state.plan_mode {
            Some(mode) => mode.workflow.present(summary),
            None => Err(PlanWorkflowError::NotInPlanMode),
        };
        result.map_err(|e| self.plan_failure(&state, e))
    }

    pub async fn accept_plan(&self) -> Result<(), CoreError> {
        self.decide_plan(PlanDisposition::Accept).await
    }

    pub async fn reject_plan(&self) -> Result<(), CoreError> {
        self.decide_plan(PlanDisposition::Reject).await
    }

    async fn decide_plan(&self, disposition: PlanDisposition) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        let decided = match (&state.plan_mode, disposition) {
            (Some(mode), PlanDisposition::Accept) => mode.workflow.accept(),
            (Some(mode), PlanDisposition::Reject) => mode.workflow.reject(),
            (None, _) => Err(PlanWorkflowError::NotInPlanMode),
        };
        if let Err(e) = decided {
            return Err(self.plan_failure(&state, e));
        }
        self.leave_plan_mode(&mut state, disposition).await
    }

    /// Send a prompt to the active session after validating attachments.
    pub async fn send_message(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<(), CoreError> {
        let state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        let Some(slot) = state.active_slot() else {
            return Err(self.report(ErrorKind::Session, None, CoreError::NoWorkSession));
        };
        let session_id = slot.info.id.as_str();

        if text.trim().is_empty() && attachments.is_empty() {
            return Err(self.report(
                ErrorKind::Validation,
                Some(session_id),
                CoreError::Validation("message is empty".to_string()),
            ));
        }
        for attachment in &attachments {
            if let Err(reason) = attachment.validate(&self.config.attachments) {
                return Err(self.report(
                    ErrorKind::Validation,
                    Some(session_id),
                    CoreError::Validation(reason),
                ));
            }
        }

        let prompt = Prompt {
            text: text.to_string(),
            attachments,
        };
        if let Err(e) = slot.handle.send(prompt).await {
            return Err(self.report(ErrorKind::Runtime, Some(session_id), e.into()));
        }
        info!(session = session_id, role = %slot.info.role, "Message sent");
        Ok(())
    }

    /// Abort the active session's current turn.
    pub async fn abort(&self) -> Result<(), CoreError> {
        let state = self.state.lock().await;
        if state.disposed {
            return Err(CoreError::Disposed);
        }
        let Some(slot) = state.active_slot() else {
            return Err(CoreError::NoWorkSession);
        };
        if let Err(e) = slot.handle.abort().await {
            return Err(self.report(ErrorKind::Runtime, Some(&slot.info.id), e.into()));
        }
        info!(session = %slot.info.id, "Turn aborted");
        Ok(())
    }

    pub async fn active_session(&self) -> Option<SessionInfo> {
        self.state.lock().await.active_slot().map(|s| s.info.clone())
    }

    pub async fn work_session(&self) -> Option<SessionInfo> {
        self.state.lock().await.work.as_ref().map(|s| s.info.clone())
    }

    pub async fn plan_session(&self) -> Option<SessionInfo> {
        self.state.lock().await.plan.as_ref().map(|s| s.info.clone())
    }

    pub fn tool_state(&self, tool_call_id: &str) -> Option<ToolExecutionState> {
        self.tracker.get(tool_call_id)
    }

    /// Tool calls of the active session, oldest first.
    pub async fn active_tool_states(&self) -> Vec<ToolExecutionState> {
        match self.active_session().await {
            Some(info) => self.tracker.list_for_session(&info.id),
            None => Vec::new(),
        }
    }

    /// Release both sessions and all temporary state. Safe to call twice.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.active = None;

        drop(self.relay.unsubscribe().await);
        for slot in [state.plan.take(), state.work.take()].into_iter().flatten() {
            if let Err(e) = slot.handle.destroy().await {
                warn!(session = %slot.info.id, "Failed to release session: {}", e);
            }
        }
        state.plan_mode = None;

        self.tracker.clear();
        self.snapshots.dispose();
        info!("Session core disposed");
    }

    // ── internals ──────────────────────────────────────────────────────

    /// Point the relay at `role`'s session. The previously active stream is
    /// parked on its slot so nothing it emits meanwhile is lost.
    async fn switch_active_session(
        &self,
        state: &mut ControllerState,
        role: SessionRole,
    ) -> Result<(), CoreError> {
        if let Some(feed) = self.relay.unsubscribe().await {
            let owner = [SessionRole::Work, SessionRole::Plan]
                .into_iter()
                .find(|r| {
                    state
                        .slot(*r)
                        .is_some_and(|s| s.info.id == feed.session_id)
                });
            match owner.and_then(|r| state.slot_mut(r)) {
                Some(slot) => slot.parked = Some(feed),
                None => info!(session = %feed.session_id, "Dropping stream of released session"),
            }
        }

        let slot = state
            .slot_mut(role)
            .ok_or_else(|| CoreError::SessionUnavailable(format!("no {} session", role)))?;
        let feed = slot.parked.take().ok_or_else(|| {
            CoreError::SessionUnavailable(format!("{} session has no event stream", role))
        })?;
        let session_id = slot.info.id.clone();

        self.relay.subscribe(feed);
        state.active = Some(role);
        info!(session = %session_id, role = %role, "Active session switched");
        Ok(())
    }

    async fn leave_plan_mode(
        &self,
        state: &mut ControllerState,
        disposition: PlanDisposition,
    ) -> Result<(), CoreError> {
        let Some(work_id) = state.work.as_ref().map(|w| w.info.id.clone()) else {
            return Err(CoreError::NoWorkSession);
        };

        if let Some(mode) = state.plan_mode.take() {
            match disposition {
                PlanDisposition::Accept => mode.document.commit().await,
                PlanDisposition::Reject => {
                    if let Err(e) = mode.document.restore().await {
                        self.channels.report(
                            ErrorKind::PlanWorkflow,
                            Some(&work_id),
                            format!(
                                "Failed to restore plan document {}: {}",
                                mode.document.path().display(),
                                e
                            ),
                        );
                    }
                }
            }
        }

        let switched = if state.active == Some(SessionRole::Work) {
            Ok(())
        } else {
            self.switch_active_session(state, SessionRole::Work).await
        };

        if let Some(plan) = state.plan.take() {
            let plan_id = plan.info.id.clone();
            if let Err(e) = plan.handle.destroy().await {
                warn!(session = %plan_id, "Failed to release plan session: {}", e);
            }
            let released = self.snapshots.release_all(&plan_id).await;
            let cleared = self.tracker.clear_session(&plan_id);
            info!(
                plan = %plan_id,
                ?disposition,
                released,
                cleared,
                "Left plan mode"
            );
        }

        self.channels.status.emit(StatusEvent::PlanModeDisabled {
            session_id: work_id,
        });
        switched
    }

    fn session_config(&self, role: SessionRole) -> SessionConfig {
        let mut config = SessionConfig::new(role, &self.config.working_dir);
        config.model = self.config.model.clone();
        config.mcp_servers = self.config.mcp_servers.clone();
        config
    }

    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<dyn RuntimeSession>, CoreError> {
        let role = config.role;
        self.runtime.create_session(config).await.map_err(|e| {
            warn!(role = %role, "Session creation failed: {}", e);
            self.runtime_failure(None, e)
        })
    }

    async fn open_slot(
        &self,
        handle: Arc<dyn RuntimeSession>,
        role: SessionRole,
        policy: Option<Arc<PlanPolicy>>,
    ) -> Result<SessionSlot, CoreError> {
        let info = SessionInfo {
            id: handle.id().to_string(),
            role,
            working_dir: self.config.working_dir.clone(),
        };

        let Some(receiver) = handle.take_events() else {
            if let Err(e) = handle.destroy().await {
                warn!(session = %info.id, "Failed to release session: {}", e);
            }
            return Err(self.report(
                ErrorKind::Runtime,
                Some(&info.id),
                CoreError::SessionUnavailable(format!(
                    "event stream of session {} was already taken",
                    info.id
                )),
            ));
        };

        let mut feed = SessionFeed::new(&info.id, &info.working_dir, receiver);
        if let Some(policy) = policy {
            feed = feed.with_policy(policy);
        }
        Ok(SessionSlot {
            info,
            handle,
            parked: Some(feed),
        })
    }

    /// Surface a runtime failure on the matching channel.
    fn runtime_failure(&self, session_id: Option<&str>, err: RuntimeError) -> CoreError {
        match &err {
            RuntimeError::AuthenticationRequired(message) => {
                warn!("Runtime requires authentication: {}", message);
                self.channels.status.emit(StatusEvent::AuthenticationRequired {
                    message: message.clone(),
                });
            }
            _ => self
                .channels
                .report(ErrorKind::Runtime, session_id, err.to_string()),
        }
        CoreError::SessionUnavailable(err.to_string())
    }

    fn plan_failure(&self, state: &ControllerState, err: PlanWorkflowError) -> CoreError {
        let session_id = state.plan.as_ref().map(|p| p.info.id.as_str());
        self.report(ErrorKind::PlanWorkflow, session_id, err.into())
    }

    fn report(&self, kind: ErrorKind, session_id: Option<&str>, err: CoreError) -> CoreError {
        self.channels.report(kind, session_id, err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ErrorEvent, FileChanged};
    use crate::events::tags;
    use crate::runtime::ScriptedRuntime;
    use crate::tracker::ToolStatus;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        dir: tempfile::TempDir,
        runtime: Arc<ScriptedRuntime>,
        controller: SessionController,
    }

    fn harness() -> Harness {
        harness_with(|config| config)
    }

    fn harness_with(tweak: impl FnOnce(CoreConfig) -> CoreConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let config = tweak(
            CoreConfig::default()
                .with_working_dir(&work)
                .with_state_dir(dir.path().join("state")),
        );
        let runtime = Arc::new(ScriptedRuntime::new());
        let snapshots = Arc::new(SnapshotStore::new_in(&dir.path().join("snapshots")).unwrap());
        let controller = SessionController::with_snapshots(
            Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
            config,
            snapshots,
        );
        Harness {
            dir,
            runtime,
            controller,
        }
    }

    async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn plan_round_trip_scenario() {
        let h = harness();
        let mut status = h.controller.channels().status.subscribe().unwrap();
        h.runtime.queue_session_id("W1");
        h.runtime.queue_session_id("P1");

        let work = h.controller.start(None).await.unwrap();
        assert_eq!(work.id, "W1");
        assert_eq!(
            next(&mut status).await,
            StatusEvent::Ready {
                session_id: "W1".into()
            }
        );
        h.controller.send_message("hello", Vec::new()).await.unwrap();

        let plan = h.controller.enter_plan_mode().await.unwrap();
        assert_eq!(plan.id, "P1");
        assert_eq!(plan.role, SessionRole::Plan);
        assert_eq!(h.controller.active_session().await.unwrap().id, "P1");
        assert_eq!(
            next(&mut status).await,
            StatusEvent::PlanModeEnabled {
                session_id: "P1".into()
            }
        );

        h.controller.present_plan("add logging").await.unwrap();
        assert_eq!(
            next(&mut status).await,
            StatusEvent::PlanReady {
                summary: "add logging".into()
            }
        );

        h.controller.accept_plan().await.unwrap();
        assert_eq!(
            next(&mut status).await,
            StatusEvent::PlanAccepted {
                summary: Some("add logging".into())
            }
        );
        assert_eq!(
            next(&mut status).await,
            StatusEvent::PlanModeDisabled {
                session_id: "W1".into()
            }
        );
        assert_eq!(h.controller.active_session().await, Some(work));
        assert!(h.controller.plan_session().await.is_none());
        assert!(h.runtime.session("P1").unwrap().is_destroyed());

        h.controller.send_message("implement it", Vec::new()).await.unwrap();
        let prompts = h.runtime.session("W1").unwrap().prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[1].text, "implement it");
    }

    #[tokio::test]
    async fn expired_resume_falls_back_to_new_session() {
        let h = harness();
        let mut status = h.controller.channels().status.subscribe().unwrap();
        h.runtime.fail_resume(
            "OLD",
            RuntimeError::SessionExpired {
                session_id: "OLD".into(),
            },
        );
        h.runtime.queue_session_id("W2");

        let info = h.controller.start(Some("OLD")).await.unwrap();
        assert_eq!(info.id, "W2");
        assert_eq!(
            next(&mut status).await,
            StatusEvent::SessionExpired {
                session_id: "OLD".into()
            }
        );
        assert_eq!(
            next(&mut status).await,
            StatusEvent::Ready {
                session_id: "W2".into()
            }
        );
    }

    #[tokio::test]
    async fn resume_reuses_known_session() {
        let h = harness();
        h.runtime.allow_resume("KEEP");
        let info = h.controller.start(Some("KEEP")).await.unwrap();
        assert_eq!(info.id, "KEEP");
        assert!(h.runtime.created_sessions().is_empty());

        // Idempotent
        let again = h.controller.start(None).await.unwrap();
        assert_eq!(again, info);
    }

    #[tokio::test]
    async fn authentication_failure_is_reported_and_retryable() {
        let h = harness();
        let mut status = h.controller.channels().status.subscribe().unwrap();
        h.runtime
            .fail_next_create(RuntimeError::AuthenticationRequired("run login".into()));

        let err = h.controller.start(None).await.unwrap_err();
        assert!(matches!(err, CoreError::SessionUnavailable(_)));
        assert_eq!(
            next(&mut status).await,
            StatusEvent::AuthenticationRequired {
                message: "run login".into()
            }
        );
        assert!(h.controller.active_session().await.is_none());

        let info = h.controller.start(None).await.unwrap();
        assert_eq!(h.controller.active_session().await, Some(info));
    }

    #[tokio::test]
    async fn plan_entry_fails_closed() {
        let h = harness();
        let mut errors = h.controller.channels().error.subscribe().unwrap();
        let work = h.controller.start(None).await.unwrap();

        h.runtime
            .fail_next_create(RuntimeError::Session("quota exceeded".into()));
        assert!(h.controller.enter_plan_mode().await.is_err());

        let ErrorEvent { kind, message, .. } = next(&mut errors).await;
        assert_eq!(kind, ErrorKind::Runtime);
        assert!(message.contains("quota exceeded"));
        assert_eq!(h.controller.active_session().await, Some(work));
        assert!(h.controller.plan_session().await.is_none());
    }

    #[tokio::test]
    async fn plan_mode_requires_work_session() {
        let h = harness();
        let mut errors = h.controller.channels().error.subscribe().unwrap();
        assert!(matches!(
            h.controller.enter_plan_mode().await,
            Err(CoreError::NoWorkSession)
        ));
        assert_eq!(next(&mut errors).await.kind, ErrorKind::Session);
    }

    #[tokio::test]
    async fn plan_session_gets_restricted_capabilities() {
        let h = harness();
        h.controller.start(None).await.unwrap();
        let plan = h.controller.enter_plan_mode().await.unwrap();
        let session = h.runtime.session(&plan.id).unwrap();

        assert_eq!(session.role(), SessionRole::Plan);
        let whitelist = session.available_tools().unwrap();
        assert!(whitelist.contains(&"view".to_string()));
        assert!(whitelist.contains(&"present_plan".to_string()));
        assert!(!whitelist.contains(&"edit".to_string()));
        assert_eq!(
            session.tool_names().await,
            vec!["plan_shell", "plan_write_file", "present_plan", "update_plan"]
        );
    }

    #[tokio::test]
    async fn reject_restores_plan_document() {
        let h = harness();
        let mut status = h.controller.channels().status.subscribe().unwrap();
        let work = h.controller.start(None).await.unwrap();
        let plan_path = crate::paths::plan_document(&h.dir.path().join("state"), &work.id);
        std::fs::create_dir_all(plan_path.parent().unwrap()).unwrap();
        std::fs::write(&plan_path, "# original").unwrap();

        let plan = h.controller.enter_plan_mode().await.unwrap();
        let session = h.runtime.session(&plan.id).unwrap();
        let written = session
            .invoke_tool("u1", "update_plan", json!({"content": "# rewritten"}))
            .await
            .unwrap();
        assert!(!written.is_error, "{}", written.output);
        assert_eq!(std::fs::read_to_string(&plan_path).unwrap(), "# rewritten");

        let presented = session
            .invoke_tool("p1", "present_plan", json!({"summary": "rewrite"}))
            .await
            .unwrap();
        assert!(!presented.is_error);

        h.controller.reject_plan().await.unwrap();
        assert_eq!(std::fs::read_to_string(&plan_path).unwrap(), "# original");

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.push(next(&mut status).await);
        }
        assert!(seen.contains(&StatusEvent::PlanReady {
            summary: "rewrite".into()
        }));
        assert!(seen.contains(&StatusEvent::PlanRejected {
            summary: Some("rewrite".into())
        }));
        assert_eq!(
            seen.last(),
            Some(&StatusEvent::PlanModeDisabled {
                session_id: work.id.clone()
            })
        );
        assert_eq!(h.controller.active_session().await, Some(work));
    }

    #[tokio::test]
    async fn decisions_outside_presented_are_rejected() {
        let h = harness();
        let mut errors = h.controller.channels().error.subscribe().unwrap();
        h.controller.start(None).await.unwrap();

        assert!(matches!(
            h.controller.accept_plan().await,
            Err(CoreError::PlanWorkflow(PlanWorkflowError::NotInPlanMode))
        ));
        h.controller.enter_plan_mode().await.unwrap();
        assert!(matches!(
            h.controller.reject_plan().await,
            Err(CoreError::PlanWorkflow(
                PlanWorkflowError::InvalidTransition { .. }
            ))
        ));
        assert_eq!(next(&mut errors).await.kind, ErrorKind::PlanWorkflow);
        assert_eq!(next(&mut errors).await.kind, ErrorKind::PlanWorkflow);
        assert!(h.controller.plan_session().await.is_some());
    }

    #[tokio::test]
    async fn exit_without_plan_mode_still_announces() {
        let h = harness();
        let mut status = h.controller.channels().status.subscribe().unwrap();
        let work = h.controller.start(None).await.unwrap();
        next(&mut status).await;

        h.controller
            .exit_plan_mode(PlanDisposition::Accept)
            .await
            .unwrap();
        assert_eq!(
            next(&mut status).await,
            StatusEvent::PlanModeDisabled { session_id: work.id }
        );
    }

    #[tokio::test]
    async fn switch_neither_loses_nor_duplicates_events() {
        let h = harness();
        let mut output = h.controller.channels().output.subscribe().unwrap();
        let mut completes = h.controller.channels().tool_complete.subscribe().unwrap();
        let work = h.controller.start(None).await.unwrap();
        let work_session = h.runtime.session(&work.id).unwrap();

        work_session.emit(
            tags::TOOL_START,
            json!({"tool_call_id": "w-tool", "tool_name": "view"}),
        );
        work_session.emit(tags::MESSAGE_DELTA, json!({"delta_content": "before"}));
        assert_eq!(next(&mut output).await.text, "before");

        let plan = h.controller.enter_plan_mode().await.unwrap();
        let plan_session = h.runtime.session(&plan.id).unwrap();

        // Inactive work session keeps running
        work_session.emit(
            tags::TOOL_COMPLETE,
            json!({"tool_call_id": "w-tool", "success": true}),
        );
        work_session.emit(tags::MESSAGE_DELTA, json!({"delta_content": "while planning"}));
        plan_session.emit(tags::MESSAGE_DELTA, json!({"delta_content": "plan text"}));

        let chunk = next(&mut output).await;
        assert_eq!((chunk.session_id.as_str(), chunk.text.as_str()), (plan.id.as_str(), "plan text"));

        h.controller
            .exit_plan_mode(PlanDisposition::Reject)
            .await
            .unwrap();

        let chunk = next(&mut output).await;
        assert_eq!(chunk.session_id, work.id);
        assert_eq!(chunk.text, "while planning");
        let done = next(&mut completes).await;
        assert_eq!(done.tool_call_id, "w-tool");
        assert_eq!(done.session_id, work.id);
        assert_eq!(
            h.controller.tool_state("w-tool").unwrap().status,
            ToolStatus::Complete
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(output.try_recv().is_err());
        assert!(completes.try_recv().is_err());
    }

    #[tokio::test]
    async fn plan_snapshots_are_released_on_exit() {
        let h = harness();
        let mut changes = h.controller.channels().file_changed.subscribe().unwrap();
        h.controller.start(None).await.unwrap();
        let plan = h.controller.enter_plan_mode().await.unwrap();
        let plan_session = h.runtime.session(&plan.id).unwrap();
        let target = h.dir.path().join("work/notes.md");

        plan_session.emit(
            tags::TOOL_START,
            json!({"tool_call_id": "pe", "tool_name": "edit", "arguments": {"path": "notes.md"}}),
        );
        plan_session.emit(
            tags::TOOL_COMPLETE,
            json!({"tool_call_id": "pe", "success": false, "error": "denied"}),
        );
        plan_session.emit(tags::FILE_CHANGED, json!({"path": "other.md"}));
        let FileChanged { path, .. } = next(&mut changes).await;
        assert_eq!(path, h.dir.path().join("work/other.md"));
        assert!(!target.exists());
        assert_eq!(h.controller.active_tool_states().await.len(), 1);

        h.controller
            .exit_plan_mode(PlanDisposition::Accept)
            .await
            .unwrap();
        assert!(h.controller.tool_state("pe").is_none());
        assert!(h.controller.active_tool_states().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_attachment_is_reported_not_sent() {
        let h = harness();
        let mut errors = h.controller.channels().error.subscribe().unwrap();
        let work = h.controller.start(None).await.unwrap();
        let image = h.dir.path().join("shot.png");
        std::fs::write(&image, b"png").unwrap();

        let err = h
            .controller
            .send_message("look", vec![Attachment::image(&image)])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let event = next(&mut errors).await;
        assert_eq!(event.kind, ErrorKind::Validation);
        assert_eq!(event.session_id.as_deref(), Some(work.id.as_str()));
        assert!(h.runtime.session(&work.id).unwrap().prompts().is_empty());

        h.controller
            .send_message("plain", vec![Attachment::file(&image)])
            .await
            .unwrap();
        assert!(h
            .controller
            .send_message("  ", Vec::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn vision_models_accept_images() {
        let h = harness_with(|mut config| {
            config.attachments.vision_enabled = true;
            config
        });
        h.controller.start(None).await.unwrap();
        let image = h.dir.path().join("shot.png");
        std::fs::write(&image, b"png").unwrap();
        h.controller
            .send_message("look", vec![Attachment::image(&image)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn abort_targets_active_session() {
        let h = harness();
        h.controller.start(None).await.unwrap();
        let plan = h.controller.enter_plan_mode().await.unwrap();
        h.controller.abort().await.unwrap();
        assert_eq!(h.runtime.session(&plan.id).unwrap().abort_count(), 1);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_final() {
        let h = harness();
        let work = h.controller.start(None).await.unwrap();
        h.controller.enter_plan_mode().await.unwrap();

        h.controller.dispose().await;
        h.controller.dispose().await;

        assert!(h.runtime.session(&work.id).unwrap().is_destroyed());
        assert!(h.controller.active_session().await.is_none());
        assert!(matches!(
            h.controller.start(None).await,
            Err(CoreError::Disposed)
        ));
        assert!(matches!(
            h.controller.send_message("hi", Vec::new()).await,
            Err(CoreError::Disposed)
        ));
        assert!(matches!(
            h.controller.enter_plan_mode().await,
            Err(CoreError::Disposed)
        ));
    }

    #[tokio::test]
    async fn new_plan_cycle_starts_on_reentry() {
        let h = harness();
        h.controller.start(None).await.unwrap();

        h.controller.enter_plan_mode().await.unwrap();
        h.controller.present_plan("v1").await.unwrap();
        h.controller.reject_plan().await.unwrap();
        assert!(matches!(
            h.controller.present_plan("too late").await,
            Err(CoreError::PlanWorkflow(PlanWorkflowError::NotInPlanMode))
        ));

        h.controller.enter_plan_mode().await.unwrap();
        h.controller.present_plan("v2").await.unwrap();
        h.controller.accept_plan().await.unwrap();
        assert!(h.controller.plan_session().await.is_none());
    }

    #[tokio::test]
    async fn nothing_is_relayed_after_dispose() {
        let h = harness();
        let mut output = h.controller.channels().output.subscribe().unwrap();
        let work = h.controller.start(None).await.unwrap();
        let plan = h.controller.enter_plan_mode().await.unwrap();
        let work_session = h.runtime.session(&work.id).unwrap();
        let plan_session = h.runtime.session(&plan.id).unwrap();

        plan_session.emit(tags::MESSAGE_DELTA, json!({"delta_content": "live"}));
        assert_eq!(next(&mut output).await.text, "live");

        h.controller.dispose().await;
        work_session.emit(tags::MESSAGE_DELTA, json!({"delta_content": "late work"}));
        plan_session.emit(tags::MESSAGE_DELTA, json!({"delta_content": "late plan"}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(output.try_recv().is_err());
    }
}
