//! Capability registry: components the agent may render and tools it may
//! call, each described by a JSON Schema compiled at registration time.

pub mod capability;
pub mod registry;
pub mod schema;

pub use capability::{
    tool_fn, Capability, CapabilityDescriptor, CapabilityKind, ComponentCapability,
    ComponentDefinition, RenderRef, ToolCapability, ToolDefinition, ToolError, ToolHandler,
};
pub use registry::{CapabilityRegistry, CapabilitySet, Registration, TurnScope};
pub use schema::{Schema, Shape};
