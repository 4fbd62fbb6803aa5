//! Custom tool surface shared by the plan policy and runtime implementations.

pub mod registry;
pub mod shell;
pub mod truncation;

pub use registry::{parse_params, Tool, ToolContext, ToolDefinition, ToolRegistry, ToolResult};
pub use shell::{classify_command, classify_command_with, ShellVerdict};
