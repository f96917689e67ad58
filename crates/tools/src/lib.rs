//! Tool registry and sandboxed execution.
//!
//! Tools are registered process-wide at boot. Two lookup paths exist: the
//! serialized owner (mutations) and a lock-free snapshot (`*_direct`) for
//! use from paths the registry itself invoked, preventing self-deadlock.

pub mod exec;
pub mod file_ops;
pub mod hooks;
pub mod registry;
pub mod sandbox;

pub use hooks::{HookDecision, HookPayload, HookPipeline, PostPayload};
pub use registry::{RegisteredTool, ToolHandler, ToolOutput, ToolRegistry};
