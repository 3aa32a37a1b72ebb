use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Why a tool call did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    /// Arguments did not satisfy the tool's input schema.
    Validation,
    /// The implementation returned an error, panicked, or produced output
    /// that does not satisfy its output schema.
    Execution,
    Timeout,
    /// No tool with that name is registered.
    NotFound,
    /// Failure reported by the server rather than produced locally.
    Remote,
}

impl ToolFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { value: Value },
    Failure { kind: ToolFailureKind, message: String },
}

/// Result of one tool call, as written back into the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub tool_name: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn success(call_id: impl Into<String>, tool_name: impl Into<String>, value: Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::Success { value },
        }
    }

    pub fn failure(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        kind: ToolFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::Failure {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Failure { .. })
    }

    pub fn failure_kind(&self) -> Option<ToolFailureKind> {
        match &self.outcome {
            ToolOutcome::Failure { kind, .. } => Some(*kind),
            ToolOutcome::Success { .. } => None,
        }
    }

    /// JSON value reported back to the agent.
    pub fn to_wire(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Success { value } => value.clone(),
            ToolOutcome::Failure { kind, message } => serde_json::json!({
                "error": message,
                "kind": kind,
            }),
        }
    }
}
