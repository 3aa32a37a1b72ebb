//! Local tool execution for Glint.
//!
//! The [`ToolCoordinator`] sits between the agent's tool-call requests and
//! the application's tool implementations: it validates arguments against
//! the tool's input schema, runs the implementation with a hard timeout,
//! validates the output, and guarantees one execution per call id.

pub mod coordinator;
pub mod sanitize;

pub use coordinator::ToolCoordinator;
pub use sanitize::sanitize_error;
