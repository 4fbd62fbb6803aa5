//! Custom tool registration surface
//!
//! Tools registered here are handed to the agent runtime when a session is
//! created. The runtime owns execution; this registry is what a runtime
//! implementation uses to look up and invoke custom handlers.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Default tool execution timeout (2 minutes)
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Tool execution result
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a success result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create a structured success envelope with `ok=true` and `data`.
    pub fn success_data(data: Value) -> Self {
        let mut envelope = serde_json::Map::new();
        envelope.insert("ok".to_string(), Value::Bool(true));
        envelope.insert("data".to_string(), data);
        Self {
            output: Value::Object(envelope).to_string(),
            is_error: false,
        }
    }

    /// Create a structured error with explicit code.
    pub fn error_with_code(code: &str, msg: impl std::fmt::Display) -> Self {
        let envelope = serde_json::json!({
            "ok": false,
            "error": {
                "code": code,
                "message": msg.to_string()
            }
        });
        Self {
            output: envelope.to_string(),
            is_error: true,
        }
    }

    /// Create an invalid-parameters error.
    pub fn invalid_parameters(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", msg)
    }

    /// Create a policy-denial error.
    pub fn denied(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("blocked_by_policy", msg)
    }

    /// Create an error result with a generic code
    pub fn error(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("tool_error", msg)
    }
}

/// Parse tool parameters, returning a ToolResult error on failure
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::invalid_parameters(format!("Invalid parameters: {}", e)))
}

/// Context for tool execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    /// Session the call belongs to
    pub session_id: String,
    /// Runtime-assigned call id, when known
    pub tool_call_id: Option<String>,
    /// Optional per-call timeout override
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(working_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            session_id: session_id.into(),
            tool_call_id: None,
            timeout: None,
        }
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// Resolve a path relative to working directory (absolute paths pass through)
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.working_dir.join(p)
        }
    }

    /// Resolve a path that may not exist yet and require it to stay under `root`.
    ///
    /// Rejects `..` components outright, then canonicalizes the nearest existing
    /// ancestor so symlinks cannot escape the root.
    pub fn resolve_new_path_within(&self, path: &str, root: &Path) -> Result<PathBuf, String> {
        let resolved = self.resolve_path(path);

        if resolved
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err("Path traversal (..) not allowed".into());
        }

        let canonical_root = canonicalize_existing_prefix(root)?;

        if resolved.exists() {
            let canonical = resolved
                .canonicalize()
                .map_err(|e| format!("Cannot resolve path: {}", e))?;
            if !canonical.starts_with(&canonical_root) {
                return Err(format!(
                    "Access denied: '{}' is outside {}",
                    path,
                    root.display()
                ));
            }
            return Ok(canonical);
        }

        let canonical = canonicalize_existing_prefix(&resolved)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(format!(
                "Access denied: '{}' is outside {}",
                path,
                root.display()
            ));
        }
        Ok(canonical)
    }
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf, String> {
    let mut check = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();

    while !check.exists() {
        match check.file_name() {
            Some(name) => suffix.push(name.to_owned()),
            None => break,
        }
        if !check.pop() {
            break;
        }
    }

    let mut base = if check.as_os_str().is_empty() || !check.exists() {
        check
    } else {
        check
            .canonicalize()
            .map_err(|e| format!("Cannot resolve path: {}", e))?
    };
    for component in suffix.into_iter().rev() {
        base.push(component);
    }
    Ok(base)
}

/// Trait for custom tool handlers
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (id)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value;

    /// Execute the tool
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

/// Serializable tool definition handed to the runtime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Registry for managing custom tools
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
    /// Default timeout for tool execution
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Build a registry from a list of tools
    pub async fn from_tools(tools: &[Arc<dyn Tool>]) -> Self {
        let registry = Self::new();
        for tool in tools {
            registry.register(Arc::clone(tool)).await;
        }
        registry
    }

    /// Register a tool
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "Replaced previously registered tool");
        }
    }

    /// Get a tool by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// Registered tool names, sorted
    pub async fn names(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all tools as runtime definitions
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name with timeout
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Option<ToolResult> {
        let tool = self.get(name).await?;
        let timeout = ctx.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_secs = timeout.as_secs(),
                    "Tool execution timed out"
                );
                ToolResult::error_with_code(
                    "timeout",
                    format!(
                        "Tool '{}' timed out after {} seconds",
                        name,
                        timeout.as_secs()
                    ),
                )
            }
        };

        tracing::info!(
            tool = name,
            session = %ctx.session_id,
            duration_ms = start.elapsed().as_millis() as u64,
            is_error = result.is_error,
            "Custom tool execution completed"
        );

        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input"
        }

        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::success(params.to_string())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Never finishes in time"
        }

        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolResult::success("late")
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("/tmp", "S1")
    }

    #[tokio::test]
    async fn unknown_tool_returns_none() {
        let registry = ToolRegistry::new();
        assert!(registry.execute("missing", json!({}), &ctx()).await.is_none());
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let result = registry
            .execute("echo", json!({"a": 1}), &ctx())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.output, r#"{"a":1}"#);
        assert_eq!(registry.names().await, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn timeout_becomes_structured_error() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;
        let mut ctx = ctx();
        ctx.timeout = Some(Duration::from_millis(20));
        let result = registry.execute("slow", json!({}), &ctx).await.unwrap();
        assert!(result.is_error);
        let parsed: Value = serde_json::from_str(&result.output).unwrap();
        assert_eq!(parsed["error"]["code"], "timeout");
    }

    #[test]
    fn parse_params_reports_invalid_parameters() {
        #[derive(serde::Deserialize, Debug)]
        struct Params {
            #[allow(dead_code)]
            name: String,
        }
        let err = parse_params::<Params>(json!({"name": 5})).unwrap_err();
        let parsed: Value = serde_json::from_str(&err.output).unwrap();
        assert_eq!(parsed["error"]["code"], "invalid_parameters");
    }

    #[test]
    fn resolve_new_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), "S1");
        let err = ctx
            .resolve_new_path_within("plans/../../etc/passwd", dir.path())
            .unwrap_err();
        assert!(err.contains("traversal"));
    }

    #[test]
    fn resolve_new_path_allows_nested_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), "S1");
        let resolved = ctx
            .resolve_new_path_within("plans/sub/plan.md", dir.path())
            .unwrap();
        assert!(resolved.ends_with("plans/sub/plan.md"));
    }

    #[test]
    fn resolve_new_path_rejects_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("plans");
        let ctx = ToolContext::new(dir.path(), "S1");
        let err = ctx
            .resolve_new_path_within("src/main.rs", &root)
            .unwrap_err();
        assert!(err.contains("Access denied"));
    }
}
