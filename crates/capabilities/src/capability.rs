//! Component and tool capability definitions.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use gl_domain::error::{Error, Result};

use crate::schema::Schema;

/// Error type tool implementations return.  Anything convertible into a
/// boxed error works, `anyhow::Error` included.
pub type ToolError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased handle to the host framework's renderable implementation.
/// Each framework binding downcasts it to its own widget type.
pub type RenderRef = Arc<dyn Any + Send + Sync>;

/// Executable side of a tool capability.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, args: Value) -> std::result::Result<Value, ToolError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, ToolError>> + Send,
{
    async fn execute(&self, args: Value) -> std::result::Result<Value, ToolError> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions (what applications hand to the registry)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ComponentDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the component's props.
    pub props_schema: Value,
    pub renderer: RenderRef,
}

pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
    /// JSON Schema for the tool's return value.  `None` accepts anything.
    pub output_schema: Option<Value>,
    pub handler: Arc<dyn ToolHandler>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compiled capabilities
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ComponentCapability {
    pub name: String,
    pub description: String,
    pub schema: Schema,
    renderer: RenderRef,
}

impl ComponentCapability {
    /// Downcast the render handle to the framework's concrete type.
    pub fn renderer<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.renderer.downcast_ref::<T>()
    }

    pub fn render_ref(&self) -> RenderRef {
        Arc::clone(&self.renderer)
    }
}

impl fmt::Debug for ComponentCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCapability")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

pub struct ToolCapability {
    pub name: String,
    pub description: String,
    pub input: Schema,
    pub output: Option<Schema>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolCapability {
    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for ToolCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCapability")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Component,
    Tool,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Tool => "tool",
        }
    }
}

/// A registered capability.  Cheap to clone.
#[derive(Debug, Clone)]
pub enum Capability {
    Component(Arc<ComponentCapability>),
    Tool(Arc<ToolCapability>),
}

impl Capability {
    /// Compile a component definition.  Fails with [`Error::Schema`] when
    /// the props schema is malformed.
    pub fn component(def: ComponentDefinition) -> Result<Self> {
        check_name(&def.name)?;
        let schema = Schema::compile_object(&def.name, &def.props_schema)?;
        Ok(Self::Component(Arc::new(ComponentCapability {
            name: def.name,
            description: def.description,
            schema,
            renderer: def.renderer,
        })))
    }

    /// Compile a tool definition.  Fails with [`Error::Schema`] when either
    /// schema is malformed.
    pub fn tool(def: ToolDefinition) -> Result<Self> {
        check_name(&def.name)?;
        let input = Schema::compile_object(&def.name, &def.input_schema)?;
        let output = def
            .output_schema
            .as_ref()
            .map(|s| Schema::compile(&def.name, s))
            .transpose()?;
        Ok(Self::Tool(Arc::new(ToolCapability {
            name: def.name,
            description: def.description,
            input,
            output,
            handler: def.handler,
        })))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Component(c) => &c.name,
            Self::Tool(t) => &t.name,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Component(c) => &c.description,
            Self::Tool(t) => &t.description,
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Component(_) => CapabilityKind::Component,
            Self::Tool(_) => CapabilityKind::Tool,
        }
    }

    pub fn as_component(&self) -> Option<&Arc<ComponentCapability>> {
        match self {
            Self::Component(c) => Some(c),
            Self::Tool(_) => None,
        }
    }

    pub fn as_tool(&self) -> Option<&Arc<ToolCapability>> {
        match self {
            Self::Tool(t) => Some(t),
            Self::Component(_) => None,
        }
    }

    /// What the agent is told about this capability.
    pub fn descriptor(&self) -> CapabilityDescriptor {
        match self {
            Self::Component(c) => CapabilityDescriptor {
                kind: CapabilityKind::Component,
                name: c.name.clone(),
                description: c.description.clone(),
                schema: c.schema.source().clone(),
                output_schema: None,
            },
            Self::Tool(t) => CapabilityDescriptor {
                kind: CapabilityKind::Tool,
                name: t.name.clone(),
                description: t.description.clone(),
                schema: t.input.source().clone(),
                output_schema: t.output.as_ref().map(|s| s.source().clone()),
            },
        }
    }
}

/// Capability advertisement sent to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    pub name: String,
    pub description: String,
    /// Props schema for components, input schema for tools.
    pub schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::schema(name, "capability name must not be empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(Error::schema(name, "capability name must not contain whitespace"));
    }
    Ok(())
}
