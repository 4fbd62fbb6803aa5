//! Lantern core - session and tool-execution event core
//!
//! Sits between an agent runtime and a presentation layer:
//! - Work and plan sessions with a single active-session pointer
//! - Ordered event relay onto fixed typed output channels
//! - Tool execution tracking with pre-mutation snapshots and diffs
//! - Plan mode with a restricted capability set and plan document workflow

pub mod channels;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod paths;
pub mod plan;
pub mod relay;
pub mod runtime;
pub mod snapshot;
pub mod tools;
pub mod tracker;

pub use channels::{CoreChannels, ErrorKind, StatusEvent};
pub use config::CoreConfig;
pub use controller::{PlanDisposition, SessionController, SessionInfo};
pub use error::{CoreError, RuntimeError};
pub use runtime::{AgentRuntime, Attachment, RuntimeSession, SessionConfig, SessionRole};
pub use tracker::{ToolExecutionState, ToolStatus};
