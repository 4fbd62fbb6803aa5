//! Plan mode: restricted capabilities, plan tools, workflow and document.

pub mod document;
pub mod policy;
pub mod tools;
pub mod workflow;

use std::path::Path;
use std::sync::Arc;

pub use document::PlanDocument;
pub use policy::{PlanPolicy, ShellDecision, READ_ONLY_BUILTINS};
pub use tools::{plan_tools, CUSTOM_TOOL_NAMES};
pub use workflow::{PlanPhase, PlanWorkflow};

use crate::channels::CoreChannels;
use crate::config::CoreConfig;
use crate::paths;
use crate::tools::Tool;

/// Everything one plan-mode entry owns.
pub struct PlanMode {
    pub policy: Arc<PlanPolicy>,
    pub document: Arc<PlanDocument>,
    pub workflow: Arc<PlanWorkflow>,
}

impl PlanMode {
    pub fn new(
        config: &CoreConfig,
        working_dir: &Path,
        work_session_id: &str,
        channels: Arc<CoreChannels>,
    ) -> Self {
        Self {
            policy: Arc::new(PlanPolicy::new(&config.plan, working_dir)),
            document: Arc::new(PlanDocument::new(paths::plan_document(
                &config.state_dir,
                work_session_id,
            ))),
            workflow: Arc::new(PlanWorkflow::new(channels)),
        }
    }

    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        plan_tools(
            Arc::clone(&self.policy),
            Arc::clone(&self.document),
            Arc::clone(&self.workflow),
        )
    }

    pub fn available_tools(&self) -> Vec<String> {
        self.policy.available_tools()
    }
}
