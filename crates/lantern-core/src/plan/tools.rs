//! Custom tools registered for plan sessions
//!
//! Each handler re-checks its own policy instead of trusting the runtime's
//! capability whitelist to keep disallowed actions away.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use super::document::PlanDocument;
use super::policy::{PlanPolicy, ShellDecision};
use super::workflow::PlanWorkflow;
use crate::tools::truncation::truncate_tail;
use crate::tools::{parse_params, Tool, ToolContext, ToolResult};

pub const UPDATE_PLAN: &str = "update_plan";
pub const PLAN_SHELL: &str = "plan_shell";
pub const PLAN_WRITE_FILE: &str = "plan_write_file";
pub const PRESENT_PLAN: &str = "present_plan";

pub const CUSTOM_TOOL_NAMES: &[&str] = &[UPDATE_PLAN, PLAN_SHELL, PLAN_WRITE_FILE, PRESENT_PLAN];

const SHELL_MAX_LINES: usize = 200;
const SHELL_MAX_BYTES: usize = 30 * 1024;

/// All plan tools wired to one plan cycle.
pub fn plan_tools(
    policy: Arc<PlanPolicy>,
    document: Arc<PlanDocument>,
    workflow: Arc<PlanWorkflow>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(UpdatePlanTool { document }),
        Arc::new(PlanShellTool {
            policy: Arc::clone(&policy),
        }),
        Arc::new(PlanWriteFileTool { policy }),
        Arc::new(PresentPlanTool { workflow }),
    ]
}

// ── update_plan ────────────────────────────────────────────────────────

pub struct UpdatePlanTool {
    document: Arc<PlanDocument>,
}

#[derive(Deserialize)]
struct UpdatePlanParams {
    content: String,
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for UpdatePlanTool {
    fn name(&self) -> &str {
        UPDATE_PLAN
    }

    fn description(&self) -> &str {
        "Replace the plan document with new markdown content. This is the only file the plan can be written to; use present_plan when the plan is ready for review."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Full markdown content of the plan"
                },
                "path": {
                    "type": "string",
                    "description": "Optional; must name the plan document itself"
                }
            },
            "required": ["content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<UpdatePlanParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if let Some(target) = params.path.as_deref() {
            if !same_file(&ctx.resolve_path(target), self.document.path()) {
                return ToolResult::denied(format!(
                    "update_plan only writes the plan document ({})",
                    self.document.path().display()
                ));
            }
        }

        match self.document.write(&params.content).await {
            Ok(()) => {
                tracing::info!(
                    session = %ctx.session_id,
                    path = %self.document.path().display(),
                    bytes = params.content.len(),
                    "Plan document updated"
                );
                ToolResult::success_data(json!({
                    "path": self.document.path(),
                    "bytes": params.content.len(),
                }))
            }
            Err(e) => ToolResult::error(format!("Failed to write plan document: {}", e)),
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

// ── plan_shell ─────────────────────────────────────────────────────────

pub struct PlanShellTool {
    policy: Arc<PlanPolicy>,
}

#[derive(Deserialize)]
struct PlanShellParams {
    command: String,
}

#[async_trait]
impl Tool for PlanShellTool {
    fn name(&self) -> &str {
        PLAN_SHELL
    }

    fn description(&self) -> &str {
        "Run a read-only shell command (listing, searching, inspecting history) in the working directory. Commands that could modify the workspace are refused."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<PlanShellParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if let ShellDecision::Denied { reason } = self.policy.check_shell(&params.command) {
            tracing::warn!(command = %params.command, %reason, "Plan shell command refused");
            return ToolResult::denied(format!("Command refused in plan mode: {}", reason));
        }

        tracing::info!(command = %params.command, "Executing plan shell command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.working_dir)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.policy.shell_timeout();
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResult::error(format!("Failed to run command: {}", e)),
            Err(_) => {
                return ToolResult::error_with_code(
                    "timeout",
                    format!("Command timed out after {} seconds", timeout.as_secs()),
                )
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        let truncated = truncate_tail(&text, SHELL_MAX_LINES, SHELL_MAX_BYTES);
        let mut rendered = truncated.text.clone();
        if let Some(notice) = truncated.notice() {
            rendered.push_str(&notice);
        }

        let exit_code = output.status.code();
        if output.status.success() {
            ToolResult::success_data(json!({
                "exit_code": exit_code,
                "output": rendered,
                "truncated": truncated.was_truncated,
            }))
        } else {
            ToolResult::error_with_code(
                "command_failed",
                format!("Exit code {:?}\n{}", exit_code, rendered),
            )
        }
    }
}

// ── plan_write_file ────────────────────────────────────────────────────

pub struct PlanWriteFileTool {
    policy: Arc<PlanPolicy>,
}

#[derive(Deserialize)]
struct PlanWriteFileParams {
    path: String,
    content: String,
}

#[async_trait]
impl Tool for PlanWriteFileTool {
    fn name(&self) -> &str {
        PLAN_WRITE_FILE
    }

    fn description(&self) -> &str {
        "Create or overwrite a supporting planning file. Only paths inside the plan directories are accepted."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Target path, relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<PlanWriteFileParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let target = match self.policy.check_write_path(ctx, &params.path) {
            Ok(target) => target,
            Err(reason) => {
                tracing::warn!(path = %params.path, %reason, "Plan file write refused");
                return ToolResult::denied(reason);
            }
        };

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create directory: {}", e));
            }
        }

        let existed = target.exists();
        match tokio::fs::write(&target, &params.content).await {
            Ok(()) => ToolResult::success_data(json!({
                "path": target,
                "bytes": params.content.len(),
                "created": !existed,
            })),
            Err(e) => ToolResult::error(format!("Failed to write file: {}", e)),
        }
    }
}

// ── present_plan ───────────────────────────────────────────────────────

pub struct PresentPlanTool {
    workflow: Arc<PlanWorkflow>,
}

#[derive(Deserialize)]
struct PresentPlanParams {
    summary: String,
}

#[async_trait]
impl Tool for PresentPlanTool {
    fn name(&self) -> &str {
        PRESENT_PLAN
    }

    fn description(&self) -> &str {
        "Present the finished plan to the user for review. Call this once the plan document is complete; the user will accept or reject it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "One-line summary of the plan shown to the user"
                }
            },
            "required": ["summary"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let params = match parse_params::<PresentPlanParams>(params) {
            Ok(p) => p,
            Err(e) => return e,
        };

        if params.summary.trim().is_empty() {
            return ToolResult::invalid_parameters("summary must not be empty");
        }

        match self.workflow.present(params.summary.trim()) {
            Ok(()) => ToolResult::success_data(json!({
                "status": "presented",
                "note": "Waiting for the user to accept or reject the plan"
            })),
            Err(e) => ToolResult::error_with_code("invalid_transition", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{CoreChannels, StatusEvent};
    use crate::config::PlanConfig;
    use crate::plan::workflow::PlanPhase;

    struct Fixture {
        dir: tempfile::TempDir,
        document: Arc<PlanDocument>,
        workflow: Arc<PlanWorkflow>,
        channels: Arc<CoreChannels>,
        tools: Vec<Arc<dyn Tool>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let channels = Arc::new(CoreChannels::new());
        let policy = Arc::new(PlanPolicy::new(&PlanConfig::default(), dir.path()));
        let document = Arc::new(PlanDocument::new(dir.path().join("state/W1/plan.md")));
        let workflow = Arc::new(PlanWorkflow::new(Arc::clone(&channels)));
        let tools = plan_tools(policy, Arc::clone(&document), Arc::clone(&workflow));
        Fixture {
            dir,
            document,
            workflow,
            channels,
            tools,
        }
    }

    impl Fixture {
        fn tool(&self, name: &str) -> Arc<dyn Tool> {
            self.tools
                .iter()
                .find(|t| t.name() == name)
                .cloned()
                .unwrap()
        }

        fn ctx(&self) -> ToolContext {
            ToolContext::new(self.dir.path(), "P1")
        }
    }

    fn error_code(result: &ToolResult) -> String {
        let parsed: Value = serde_json::from_str(&result.output).unwrap();
        parsed["error"]["code"].as_str().unwrap().to_string()
    }

    #[test]
    fn registers_every_custom_tool() {
        let f = fixture();
        let names: Vec<&str> = f.tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, CUSTOM_TOOL_NAMES);
    }

    #[tokio::test]
    async fn update_plan_writes_only_the_document() {
        let f = fixture();
        let tool = f.tool(UPDATE_PLAN);

        let ok = tool
            .execute(json!({"content": "# Plan"}), &f.ctx())
            .await;
        assert!(!ok.is_error);
        assert_eq!(f.document.read().await.unwrap().as_deref(), Some("# Plan"));

        let refused = tool
            .execute(json!({"content": "x", "path": "src/lib.rs"}), &f.ctx())
            .await;
        assert!(refused.is_error);
        assert_eq!(error_code(&refused), "blocked_by_policy");
        assert!(!f.dir.path().join("src/lib.rs").exists());
    }

    #[tokio::test]
    async fn plan_shell_refuses_mutation() {
        let f = fixture();
        let tool = f.tool(PLAN_SHELL);
        let result = tool
            .execute(json!({"command": "touch created.txt"}), &f.ctx())
            .await;
        assert_eq!(error_code(&result), "blocked_by_policy");
        assert!(!f.dir.path().join("created.txt").exists());
    }

    #[tokio::test]
    async fn plan_shell_refuses_indirect_writes() {
        let f = fixture();
        std::fs::write(f.dir.path().join("victim.txt"), "keep").unwrap();
        let tool = f.tool(PLAN_SHELL);

        for command in [
            "echo $(touch sub.txt)",
            "echo victim.txt | xargs rm",
            "sh -c 'touch shc.txt'",
            "find . -maxdepth 0 -fprint fp.txt",
            "env touch env.txt",
            "awk 'BEGIN { system(\"touch awk.txt\") }'",
        ] {
            let result = tool.execute(json!({ "command": command }), &f.ctx()).await;
            assert_eq!(error_code(&result), "blocked_by_policy", "{}", command);
        }

        for created in ["sub.txt", "shc.txt", "fp.txt", "env.txt", "awk.txt"] {
            assert!(!f.dir.path().join(created).exists(), "{}", created);
        }
        assert!(f.dir.path().join("victim.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn plan_shell_runs_read_only_commands() {
        let f = fixture();
        std::fs::write(f.dir.path().join("notes.txt"), "alpha\n").unwrap();
        let tool = f.tool(PLAN_SHELL);
        let result = tool
            .execute(json!({"command": "cat notes.txt"}), &f.ctx())
            .await;
        assert!(!result.is_error, "{}", result.output);
        let parsed: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(parsed["data"]["exit_code"], 0);
        assert!(parsed["data"]["output"].as_str().unwrap().contains("alpha"));
    }

    #[tokio::test]
    async fn plan_write_file_is_path_restricted() {
        let f = fixture();
        let tool = f.tool(PLAN_WRITE_FILE);

        let ok = tool
            .execute(
                json!({"path": ".lantern/plans/design.md", "content": "notes"}),
                &f.ctx(),
            )
            .await;
        assert!(!ok.is_error, "{}", ok.output);
        assert!(f.dir.path().join(".lantern/plans/design.md").is_file());

        let refused = tool
            .execute(json!({"path": "Cargo.toml", "content": "x"}), &f.ctx())
            .await;
        assert_eq!(error_code(&refused), "blocked_by_policy");
        assert!(!f.dir.path().join("Cargo.toml").exists());
    }

    #[tokio::test]
    async fn present_plan_drives_workflow() {
        let f = fixture();
        let mut status = f.channels.status.subscribe().unwrap();
        let tool = f.tool(PRESENT_PLAN);

        let result = tool
            .execute(json!({"summary": "add logging"}), &f.ctx())
            .await;
        assert!(!result.is_error);
        assert_eq!(f.workflow.phase(), PlanPhase::Presented);
        assert_eq!(
            status.try_recv().unwrap(),
            StatusEvent::PlanReady {
                summary: "add logging".into()
            }
        );

        f.workflow.accept().unwrap();
        let again = tool
            .execute(json!({"summary": "more"}), &f.ctx())
            .await;
        assert_eq!(error_code(&again), "invalid_transition");

        let empty = tool.execute(json!({"summary": " "}), &f.ctx()).await;
        assert_eq!(error_code(&empty), "invalid_parameters");
    }
}
