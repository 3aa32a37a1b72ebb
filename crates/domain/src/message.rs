use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tool::{ToolCallRequest, ToolCallResult};
use crate::turn::TurnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
    Tool,
}

/// Completion status of a field (or a whole value) under construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldStatus {
    #[default]
    Pending,
    Streaming,
    Complete,
}

/// A component the agent chose to render, with its props as assembled so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentPart {
    pub name: String,
    pub props: Value,
    pub status: FieldStatus,
    /// False when the agent named a component that is not registered.  The
    /// UI renders a fallback instead of failing.
    pub resolved: bool,
}

/// A reference to binary content (an upload, an image) held elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Binary { attachment: Attachment },
    Component(ComponentPart),
}

/// One role-tagged entry in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolCallResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
    /// Set once the owning turn reaches a terminal state.
    #[serde(default)]
    pub frozen: bool,
    /// Failure reason shown inline next to the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server-assigned position.  `None` for client-optimistic messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    /// Turn that produced this message.  `None` for user messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
}

/// A mutation of one message, applied through the thread store.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePatch {
    AppendText(String),
    AppendReasoning(String),
    /// Insert or replace the component part with the same name.
    UpsertComponent(ComponentPart),
    /// First result wins; later results for the same call are ignored.
    SetToolResult(ToolCallResult),
    /// Server acknowledged the message under its authoritative id.
    Acknowledge { id: String, sequence: u64 },
    Fail { reason: String },
    Freeze { cancelled: bool },
}

impl MessagePatch {
    fn touches_content(&self) -> bool {
        matches!(
            self,
            Self::AppendText(_)
                | Self::AppendReasoning(_)
                | Self::UpsertComponent(_)
                | Self::SetToolResult(_)
        )
    }
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    fn empty(role: Role) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts: Vec::new(),
            reasoning: Vec::new(),
            tool_call: None,
            tool_result: None,
            created_at: Utc::now(),
            cancelled: false,
            frozen: false,
            error: None,
            sequence: None,
            idempotency_token: None,
            turn_id: None,
        }
    }

    /// An optimistic user message with a fresh idempotency token.
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        let mut msg = Self::empty(Role::User);
        let text = text.into();
        if !text.is_empty() {
            msg.parts.push(ContentPart::Text { text });
        }
        msg.parts.extend(
            attachments
                .into_iter()
                .map(|attachment| ContentPart::Binary { attachment }),
        );
        msg.idempotency_token = Some(uuid::Uuid::new_v4().to_string());
        // The user's own message is complete the moment it is sent.
        msg.frozen = true;
        msg
    }

    pub fn agent() -> Self {
        Self::empty(Role::Agent)
    }

    pub fn tool(request: ToolCallRequest) -> Self {
        let mut msg = Self::empty(Role::Tool);
        msg.tool_call = Some(request);
        msg
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_turn(mut self, turn_id: &TurnId) -> Self {
        self.turn_id = Some(turn_id.clone());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn component(&self) -> Option<&ComponentPart> {
        self.parts.iter().rev().find_map(|p| match p {
            ContentPart::Component(c) => Some(c),
            _ => None,
        })
    }

    /// Apply a patch.  Returns whether the message changed.
    ///
    /// Content patches on a frozen message fail with [`Error::MessageFrozen`].
    pub fn apply(&mut self, patch: MessagePatch) -> Result<bool> {
        if self.frozen && patch.touches_content() {
            return Err(Error::MessageFrozen(self.id.clone()));
        }
        match patch {
            MessagePatch::AppendText(delta) => {
                if delta.is_empty() {
                    return Ok(false);
                }
                match self.parts.last_mut() {
                    Some(ContentPart::Text { text }) => text.push_str(&delta),
                    _ => self.parts.push(ContentPart::Text { text: delta }),
                }
                Ok(true)
            }
            MessagePatch::AppendReasoning(step) => {
                self.reasoning.push(step);
                Ok(true)
            }
            MessagePatch::UpsertComponent(component) => {
                let existing = self.parts.iter_mut().rev().find_map(|p| match p {
                    ContentPart::Component(c) if c.name == component.name => Some(c),
                    _ => None,
                });
                match existing {
                    Some(current) if *current == component => Ok(false),
                    Some(current) => {
                        *current = component;
                        Ok(true)
                    }
                    None => {
                        self.parts.push(ContentPart::Component(component));
                        Ok(true)
                    }
                }
            }
            MessagePatch::SetToolResult(result) => {
                if self.tool_result.is_some() {
                    return Ok(false);
                }
                self.tool_result = Some(result);
                Ok(true)
            }
            MessagePatch::Acknowledge { id, sequence } => {
                let changed = self.id != id || self.sequence != Some(sequence);
                self.id = id;
                self.sequence = Some(sequence);
                Ok(changed)
            }
            MessagePatch::Fail { reason } => {
                let changed = self.error.as_deref() != Some(reason.as_str());
                self.error = Some(reason);
                Ok(changed)
            }
            MessagePatch::Freeze { cancelled } => {
                let changed = !self.frozen || (cancelled && !self.cancelled);
                self.frozen = true;
                self.cancelled |= cancelled;
                Ok(changed)
            }
        }
    }
}
