//! In-process scripted runtime
//!
//! A deterministic `AgentRuntime` that never talks to a model. Callers push
//! raw events into sessions, decide which create/resume calls fail, and
//! invoke the custom tools a session registered. Used by the test suites and
//! by `lantern replay`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    AgentRuntime, Prompt, RawEventReceiver, RuntimeSession, SessionConfig, SessionRole,
};
use crate::error::RuntimeError;
use crate::events::{tags, RawEnvelope};
use crate::tools::{ToolContext, ToolRegistry, ToolResult};

#[derive(Default)]
struct ScriptState {
    next_id: u64,
    queued_ids: VecDeque<String>,
    create_failures: VecDeque<RuntimeError>,
    resume_failures: HashMap<String, RuntimeError>,
    resumable: HashSet<String>,
    sessions: HashMap<String, Arc<ScriptedSession>>,
    created: Vec<String>,
}

/// Scripted stand-in for the external agent runtime.
#[derive(Default)]
pub struct ScriptedRuntime {
    state: Mutex<ScriptState>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for the next created session (otherwise `session-N`).
    pub fn queue_session_id(&self, id: impl Into<String>) {
        self.state.lock().queued_ids.push_back(id.into());
    }

    /// Make the next `create_session` call fail.
    pub fn fail_next_create(&self, error: RuntimeError) {
        self.state.lock().create_failures.push_back(error);
    }

    /// Make resuming `session_id` fail with `error`.
    pub fn fail_resume(&self, session_id: impl Into<String>, error: RuntimeError) {
        self.state
            .lock()
            .resume_failures
            .insert(session_id.into(), error);
    }

    /// Allow `session_id` to be resumed.
    pub fn allow_resume(&self, session_id: impl Into<String>) {
        self.state.lock().resumable.insert(session_id.into());
    }

    /// Most recent handle issued for `session_id`.
    pub fn session(&self, session_id: &str) -> Option<Arc<ScriptedSession>> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Ids of every session created (not resumed), in creation order.
    pub fn created_sessions(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    async fn open(&self, id: String, config: SessionConfig) -> Arc<ScriptedSession> {
        let registry = ToolRegistry::from_tools(&config.tools).await;
        let session = Arc::new(ScriptedSession::new(id.clone(), &config, registry));
        self.state.lock().sessions.insert(id, Arc::clone(&session));
        session
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn create_session(
        &self,
        config: SessionConfig,
    ) -> Result<Arc<dyn RuntimeSession>, RuntimeError> {
        let id = {
            let mut state = self.state.lock();
            if let Some(err) = state.create_failures.pop_front() {
                return Err(err);
            }
            let id = match state.queued_ids.pop_front() {
                Some(id) => id,
                None => {
                    state.next_id += 1;
                    format!("session-{}", state.next_id)
                }
            };
            state.created.push(id.clone());
            state.resumable.insert(id.clone());
            id
        };
        debug!(session = %id, role = %config.role, "Scripted session created");
        Ok(self.open(id, config).await)
    }

    async fn resume_session(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> Result<Arc<dyn RuntimeSession>, RuntimeError> {
        {
            let state = self.state.lock();
            if let Some(err) = state.resume_failures.get(session_id) {
                return Err(err.clone());
            }
            if !state.resumable.contains(session_id) {
                return Err(RuntimeError::SessionNotFound {
                    session_id: session_id.to_string(),
                });
            }
        }
        debug!(session = %session_id, role = %config.role, "Scripted session resumed");
        Ok(self.open(session_id.to_string(), config).await)
    }
}

/// One scripted session handle.
pub struct ScriptedSession {
    id: String,
    role: SessionRole,
    working_dir: PathBuf,
    available_tools: Option<Vec<String>>,
    tx: mpsc::UnboundedSender<RawEnvelope>,
    rx: Mutex<Option<RawEventReceiver>>,
    registry: ToolRegistry,
    prompts: Mutex<Vec<Prompt>>,
    aborts: Mutex<usize>,
    destroyed: AtomicBool,
}

impl ScriptedSession {
    fn new(id: String, config: &SessionConfig, registry: ToolRegistry) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            role: config.role,
            working_dir: config.working_dir.clone(),
            available_tools: config.available_tools.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            registry,
            prompts: Mutex::new(Vec::new()),
            aborts: Mutex::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Whitelist the session was created with.
    pub fn available_tools(&self) -> Option<Vec<String>> {
        self.available_tools.clone()
    }

    /// Names of the custom tools the session registered.
    pub async fn tool_names(&self) -> Vec<String> {
        self.registry.names().await
    }

    /// Push a raw event into the session's stream.
    pub fn emit(&self, kind: &str, data: Value) {
        self.emit_envelope(RawEnvelope::new(kind, data));
    }

    pub fn emit_envelope(&self, envelope: RawEnvelope) {
        if self.tx.send(envelope).is_err() {
            debug!(session = %self.id, "Scripted event dropped, stream closed");
        }
    }

    /// Run a registered custom tool the way the runtime would, bracketing it
    /// with start and complete events. Returns `None` for unknown tools.
    pub async fn invoke_tool(
        &self,
        tool_call_id: &str,
        name: &str,
        arguments: Value,
    ) -> Option<ToolResult> {
        self.registry.get(name).await?;

        self.emit(
            tags::TOOL_START,
            json!({
                "tool_call_id": tool_call_id,
                "tool_name": name,
                "arguments": arguments.clone(),
            }),
        );

        let ctx = ToolContext::new(&self.working_dir, &self.id).with_tool_call_id(tool_call_id);
        let result = self.registry.execute(name, arguments, &ctx).await?;

        let data = if result.is_error {
            json!({
                "tool_call_id": tool_call_id,
                "success": false,
                "error": result.output.clone(),
            })
        } else {
            json!({
                "tool_call_id": tool_call_id,
                "success": true,
                "result": { "content": result.output.clone() },
            })
        };
        self.emit(tags::TOOL_COMPLETE, data);
        Some(result)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().clone()
    }

    pub fn abort_count(&self) -> usize {
        *self.aborts.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeSession for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn take_events(&self) -> Option<RawEventReceiver> {
        self.rx.lock().take()
    }

    async fn send(&self, prompt: Prompt) -> Result<(), RuntimeError> {
        if self.is_destroyed() {
            return Err(RuntimeError::Closed);
        }
        self.prompts.lock().push(prompt);
        Ok(())
    }

    async fn abort(&self) -> Result<(), RuntimeError> {
        if self.is_destroyed() {
            return Err(RuntimeError::Closed);
        }
        *self.aborts.lock() += 1;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RuntimeError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
