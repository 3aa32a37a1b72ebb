use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for transport event streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events delivered by the transport while an agent turn is in progress.
///
/// The engine consumes these strictly in delivery order.  Event types this
/// build does not know about deserialize to [`StreamEvent::Unknown`] and are
/// ignored, so newer servers can add events without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// The server accepted the turn.  Carries the id and sequence the
    /// server assigned to the agent message, when it assigns them up front.
    TurnStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },

    /// Incremental assistant text.
    TextDelta { delta: String },

    /// The agent picked a component to render.
    ComponentSelected { name: String },

    /// One piece of the selected component's props.
    ArgumentFragment {
        path: String,
        value: Value,
        sequence: u64,
    },

    /// Transport framing says the field at `path` will receive no more data.
    FieldComplete { path: String },

    /// The agent asks the client to run a locally registered tool.
    ToolCallRequested {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },

    /// Result of a tool call, either echoed by the server or produced locally.
    ToolResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A reasoning/thinking step.
    ReasoningStep { text: String },

    TurnComplete,

    TurnError { reason: String },

    /// Final acknowledgment that the server will send nothing more for the turn.
    TurnClosed,

    /// Server echo of the user's message, matched by idempotency token.
    MessageAcknowledged {
        idempotency_token: String,
        message_id: String,
        sequence: u64,
    },

    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Parse one JSON-encoded event (one line of a JSONL recording).
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Short event name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::TurnStarted { .. } => "turn-started",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::ComponentSelected { .. } => "component-selected",
            StreamEvent::ArgumentFragment { .. } => "argument-fragment",
            StreamEvent::FieldComplete { .. } => "field-complete",
            StreamEvent::ToolCallRequested { .. } => "tool-call-requested",
            StreamEvent::ToolResult { .. } => "tool-result",
            StreamEvent::ReasoningStep { .. } => "reasoning-step",
            StreamEvent::TurnComplete => "turn-complete",
            StreamEvent::TurnError { .. } => "turn-error",
            StreamEvent::TurnClosed => "turn-closed",
            StreamEvent::MessageAcknowledged { .. } => "message-acknowledged",
            StreamEvent::Unknown => "unknown",
        }
    }
}
