use serde::Serialize;

/// Structured trace events emitted across all Glint crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    CapabilityRegistered {
        kind: &'static str,
        name: String,
        replaced: bool,
    },
    CapabilityRegistrationDeferred {
        name: String,
    },
    TurnStarted {
        thread_id: String,
        turn_id: String,
    },
    TurnFinished {
        thread_id: String,
        turn_id: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        events: u64,
        duration_ms: u64,
    },
    AssemblyWarning {
        turn_id: String,
        component: String,
        path: String,
        warning: String,
    },
    ComponentUnresolved {
        turn_id: String,
        name: String,
    },
    ToolInvoked {
        call_id: String,
        tool: String,
        outcome: String,
        duration_ms: u64,
    },
    ToolCallCoalesced {
        call_id: String,
    },
    ThreadSwitched {
        from: String,
        to: String,
        drained: bool,
    },
    MessageReconciled {
        thread_id: String,
        message_id: String,
        sequence: u64,
    },
    DraftsPersisted {
        drafts: usize,
        ok: bool,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "gl_event");
    }
}
