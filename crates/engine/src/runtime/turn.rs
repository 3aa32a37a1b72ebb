//! Turn driver.
//!
//! One task per active turn.  It owns the turn's state machine, its pinned
//! view of the capability registry and the assembler for the selected
//! component, and it is the only writer of the messages the turn produces.
//! Transport events are handled strictly in delivery order; results of
//! local tool calls re-enter the same loop through a channel.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use gl_capabilities::{CapabilityRegistry, TurnScope};
use gl_domain::error::Error;
use gl_domain::message::{ComponentPart, FieldStatus, Message, MessagePatch};
use gl_domain::stream::StreamEvent;
use gl_domain::tool::{ToolCallRequest, ToolCallResult, ToolFailureKind};
use gl_domain::trace::TraceEvent;
use gl_domain::turn::{TurnId, TurnState};
use gl_stream::{ArgPath, AssemblyWarning, Fragment, PartialAssembler, Signal, TurnMachine};
use gl_threads::ThreadStore;
use gl_tools::ToolCoordinator;

use crate::runtime::cancel::TurnMap;
use crate::transport::{Transport, TurnRequest};

/// Services a turn driver works against.
#[derive(Clone)]
pub struct TurnDeps {
    pub store: Arc<ThreadStore>,
    pub registry: Arc<CapabilityRegistry>,
    pub tools: Arc<ToolCoordinator>,
    pub transport: Arc<dyn Transport>,
    pub turns: Arc<TurnMap>,
}

/// Spawn the driver for `request`.  The capability scope is pinned before
/// this returns, so registrations made after `send` are deferred for names
/// the turn uses.  A driver that panics leaves the turn in
/// [`TurnState::Error`] and the thread free for the next send.
pub fn spawn_turn(
    deps: TurnDeps,
    request: TurnRequest,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let span = tracing::info_span!(
        "turn",
        thread_id = %request.thread_id,
        turn_id = %request.turn_id,
    );
    let thread_id = request.thread_id.clone();
    let turn_id = request.turn_id.clone();
    let (driver, results) = TurnDriver::new(deps.clone(), &request, cancel.clone());
    tokio::spawn(
        async move {
            let run = AssertUnwindSafe(driver.run(request, results)).catch_unwind();
            if let Err(panic) = run.await {
                let reason = format!("turn driver crashed: {}", panic_message(&*panic));
                recover_crashed_turn(&deps, &thread_id, &turn_id, &cancel, reason);
            }
        }
        .instrument(span),
    )
}

fn recover_crashed_turn(
    deps: &TurnDeps,
    thread_id: &str,
    turn_id: &TurnId,
    cancel: &CancellationToken,
    reason: String,
) {
    tracing::error!(reason = %reason, "turn driver panicked");
    if let Err(e) =
        deps.store
            .finish_turn(thread_id, turn_id, TurnState::Error, Some(reason.clone()))
    {
        tracing::warn!(error = %e, "failed to record crashed turn");
    }
    cancel.cancel();
    deps.turns.remove(thread_id, turn_id);
    TraceEvent::TurnFinished {
        thread_id: thread_id.to_owned(),
        turn_id: turn_id.to_string(),
        state: TurnState::Error.to_string(),
        reason: Some(reason),
        events: 0,
        duration_ms: 0,
    }
    .emit();
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Complete,
    Failed { reason: String, transport: bool },
    Cancelled,
}

impl Outcome {
    fn state(&self) -> TurnState {
        match self {
            Self::Complete => TurnState::Complete,
            Self::Failed { .. } => TurnState::Error,
            Self::Cancelled => TurnState::Cancelled,
        }
    }

    fn signal(&self) -> Signal {
        match self {
            Self::Complete => Signal::TurnComplete,
            Self::Failed { transport: true, .. } => Signal::TransportFailure,
            Self::Failed { .. } => Signal::TurnError,
            Self::Cancelled => Signal::Cancel,
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            Self::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }

    fn transport(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            transport: true,
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

struct ActiveComponent {
    name: String,
    /// `None` when the agent named a component that is not registered.
    assembler: Option<PartialAssembler>,
}

struct ToolCallEntry {
    message_id: String,
    tool_name: String,
}

struct TurnDriver {
    deps: TurnDeps,
    thread_id: String,
    turn_id: TurnId,
    machine: TurnMachine,
    scope: TurnScope,
    cancel: CancellationToken,
    /// Agent message, created on the first content.
    agent: Option<String>,
    component: Option<ActiveComponent>,
    tool_calls: HashMap<String, ToolCallEntry>,
    results_tx: mpsc::UnboundedSender<ToolCallResult>,
    events: u64,
    started: Instant,
}

impl TurnDriver {
    fn new(
        deps: TurnDeps,
        request: &TurnRequest,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ToolCallResult>) {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let mut machine = TurnMachine::new();
        if let Err(e) = machine.start() {
            tracing::warn!(error = %e, "fresh turn machine refused to start");
        }
        let scope = deps.registry.begin_turn();
        let driver = Self {
            deps,
            thread_id: request.thread_id.clone(),
            turn_id: request.turn_id.clone(),
            machine,
            scope,
            cancel,
            agent: None,
            component: None,
            tool_calls: HashMap::new(),
            results_tx,
            events: 0,
            started: Instant::now(),
        };
        (driver, results_rx)
    }

    async fn run(mut self, request: TurnRequest, mut results: mpsc::UnboundedReceiver<ToolCallResult>) {
        tracing::info!(capabilities = request.capabilities.len(), "turn started");
        TraceEvent::TurnStarted {
            thread_id: self.thread_id.clone(),
            turn_id: self.turn_id.to_string(),
        }
        .emit();

        let outcome = self.drive(request, &mut results).await;
        self.finish(outcome).await;
    }

    async fn drive(
        &mut self,
        request: TurnRequest,
        results: &mut mpsc::UnboundedReceiver<ToolCallResult>,
    ) -> Outcome {
        let cancel = self.cancel.clone();
        let transport = Arc::clone(&self.deps.transport);

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            started = transport.start_turn(request) => match started {
                Ok(stream) => stream,
                Err(e) => return Outcome::transport(e.to_string()),
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                Some(result) = results.recv() => {
                    if let Some(outcome) = self.on_tool_result(result).await {
                        return outcome;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if let Some(outcome) = self.on_event(event) {
                            return outcome;
                        }
                    }
                    Some(Err(e)) => return Outcome::transport(e.to_string()),
                    None => return Outcome::transport("stream ended before the turn completed"),
                },
            }
        }
    }

    fn on_event(&mut self, event: StreamEvent) -> Option<Outcome> {
        self.events += 1;
        tracing::trace!(kind = event.kind(), "event");
        if let Some(signal) = Signal::from_event(&event) {
            self.transition(signal);
        }

        match event {
            StreamEvent::TurnStarted {
                message_id: Some(id),
                sequence,
            } => self.adopt_agent_id(id, sequence),
            StreamEvent::TurnStarted { .. } => {}
            StreamEvent::TextDelta { delta } => self.patch_agent(MessagePatch::AppendText(delta)),
            StreamEvent::ReasoningStep { text } => {
                self.patch_agent(MessagePatch::AppendReasoning(text))
            }
            StreamEvent::ComponentSelected { name } => self.select_component(name),
            StreamEvent::ArgumentFragment {
                path,
                value,
                sequence,
            } => self.apply_fragment(Fragment::new(&path, value, sequence)),
            StreamEvent::FieldComplete { path } => self.complete_field(&ArgPath::parse(&path)),
            StreamEvent::ToolCallRequested {
                id,
                name,
                arguments,
            } => self.request_tool(ToolCallRequest {
                call_id: id,
                tool_name: name,
                arguments,
            }),
            StreamEvent::ToolResult { id, result, error } => {
                self.record_remote_result(id, result, error)
            }
            StreamEvent::TurnComplete => return Some(Outcome::Complete),
            StreamEvent::TurnError { reason } => {
                return Some(Outcome::Failed {
                    reason,
                    transport: false,
                })
            }
            StreamEvent::TurnClosed => tracing::debug!("server closed the turn"),
            StreamEvent::MessageAcknowledged {
                idempotency_token,
                message_id,
                sequence,
            } => {
                if let Err(e) = self.deps.store.reconcile(
                    &self.thread_id,
                    &idempotency_token,
                    &message_id,
                    sequence,
                ) {
                    tracing::warn!(error = %e, "failed to reconcile acknowledged message");
                }
            }
            StreamEvent::Unknown => tracing::debug!("ignoring event of unknown type"),
        }
        None
    }

    /// Feed the machine and mirror non-terminal states onto the thread.
    /// Terminal states are recorded by [`Self::finish`].
    fn transition(&mut self, signal: Signal) {
        let Some(state) = self.machine.on(signal) else {
            return;
        };
        if state.is_terminal() {
            return;
        }
        if let Err(e) = self
            .deps
            .store
            .set_turn_state(&self.thread_id, &self.turn_id, state)
        {
            tracing::warn!(error = %e, state = %state, "failed to record turn state");
        }
    }

    // ── messages ───────────────────────────────────────────────────

    /// Append a message for this turn.  False once the turn was finished
    /// from outside (cancelled).
    fn append(&self, message: Message) -> bool {
        match self
            .deps
            .store
            .append_turn_message(&self.thread_id, &self.turn_id, message)
        {
            Ok(appended) => appended,
            Err(e) => {
                tracing::warn!(error = %e, "failed to append turn message");
                false
            }
        }
    }

    fn patch(&self, message_id: &str, patch: MessagePatch) -> bool {
        match self
            .deps
            .store
            .update_message(&self.thread_id, message_id, patch)
        {
            Ok(changed) => changed,
            Err(Error::MessageFrozen(_)) => {
                tracing::debug!(message_id, "late write to a frozen message dropped");
                false
            }
            Err(e) => {
                tracing::warn!(message_id, error = %e, "failed to update message");
                false
            }
        }
    }

    fn ensure_agent(&mut self) -> Option<String> {
        if let Some(id) = &self.agent {
            return Some(id.clone());
        }
        let message = Message::agent();
        let id = message.id.clone();
        if !self.append(message) {
            return None;
        }
        self.agent = Some(id.clone());
        Some(id)
    }

    fn patch_agent(&mut self, patch: MessagePatch) {
        if let Some(id) = self.ensure_agent() {
            self.patch(&id, patch);
        }
    }

    /// The server assigned the agent message its id (and position).
    fn adopt_agent_id(&mut self, id: String, sequence: Option<u64>) {
        match self.agent.clone() {
            None => {
                let mut message = Message::agent().with_id(id.clone());
                if let Some(sequence) = sequence {
                    message = message.with_sequence(sequence);
                }
                if self.append(message) {
                    self.agent = Some(id);
                }
            }
            Some(current) => {
                let Some(sequence) = sequence else {
                    tracing::debug!(message_id = %id, "server id without sequence for an existing message ignored");
                    return;
                };
                let patch = MessagePatch::Acknowledge {
                    id: id.clone(),
                    sequence,
                };
                if self.patch(&current, patch) {
                    self.agent = Some(id);
                }
            }
        }
    }

    // ── components ─────────────────────────────────────────────────

    fn select_component(&mut self, name: String) {
        if self.component.as_ref().is_some_and(|c| c.name == name) {
            tracing::debug!(component = %name, "component selected again");
            return;
        }

        let assembler = match self.scope.resolve_component(&name) {
            Ok(component) => Some(PartialAssembler::new(&component.schema)),
            Err(e) => {
                tracing::warn!(component = %name, error = %e, "agent selected an unregistered component");
                TraceEvent::ComponentUnresolved {
                    turn_id: self.turn_id.to_string(),
                    name: name.clone(),
                }
                .emit();
                None
            }
        };
        self.component = Some(ActiveComponent { name, assembler });
        self.publish_component();
    }

    fn apply_fragment(&mut self, fragment: Fragment) {
        let Some(component) = self.component.as_mut() else {
            tracing::warn!(path = %fragment.path, "argument fragment before any component was selected");
            return;
        };
        let name = component.name.clone();
        let Some(assembler) = component.assembler.as_mut() else {
            tracing::debug!(component = %name, "fragment for unresolved component dropped");
            return;
        };

        match assembler.apply(fragment) {
            Ok(applied) => {
                for warning in &applied.warnings {
                    self.assembly_warning(&name, warning);
                }
                if applied.changed {
                    self.publish_component();
                }
            }
            Err(warning) => self.assembly_warning(&name, &warning),
        }
    }

    fn complete_field(&mut self, path: &ArgPath) {
        let Some(component) = self.component.as_mut() else {
            tracing::debug!(path = %path, "field completion before any component was selected");
            return;
        };
        let name = component.name.clone();
        let Some(assembler) = component.assembler.as_mut() else {
            return;
        };

        match assembler.complete(path) {
            Ok(true) => self.publish_component(),
            Ok(false) => {}
            Err(warning) => self.assembly_warning(&name, &warning),
        }
    }

    fn publish_component(&mut self) {
        let part = match &self.component {
            None => return,
            Some(ActiveComponent {
                name,
                assembler: Some(assembler),
            }) => ComponentPart {
                name: name.clone(),
                props: assembler.snapshot(),
                status: assembler.status(),
                resolved: true,
            },
            Some(ActiveComponent {
                name,
                assembler: None,
            }) => ComponentPart {
                name: name.clone(),
                props: Value::Object(Default::default()),
                status: FieldStatus::Pending,
                resolved: false,
            },
        };
        self.patch_agent(MessagePatch::UpsertComponent(part));
    }

    fn assembly_warning(&self, component: &str, warning: &AssemblyWarning) {
        tracing::warn!(component, path = warning.path(), warning = %warning, "assembly warning");
        TraceEvent::AssemblyWarning {
            turn_id: self.turn_id.to_string(),
            component: component.to_owned(),
            path: warning.path().to_owned(),
            warning: warning.to_string(),
        }
        .emit();
    }

    // ── tools ──────────────────────────────────────────────────────

    fn request_tool(&mut self, request: ToolCallRequest) {
        if self.tool_calls.contains_key(&request.call_id) {
            tracing::debug!(call_id = %request.call_id, "duplicate tool call request");
            return;
        }
        // Pins the tool for the rest of the turn.  Unknown tools are
        // reported back as a failed result by the coordinator.
        if self.scope.resolve_tool(&request.tool_name).is_err() {
            tracing::debug!(tool = %request.tool_name, "tool is not registered locally");
        }

        let message = Message::tool(request.clone());
        let message_id = message.id.clone();
        if !self.append(message) {
            return;
        }
        self.tool_calls.insert(
            request.call_id.clone(),
            ToolCallEntry {
                message_id,
                tool_name: request.tool_name.clone(),
            },
        );

        let tools = Arc::clone(&self.deps.tools);
        let results = self.results_tx.clone();
        let wait = self.cancel.child_token();
        tokio::spawn(
            async move {
                if let Some(result) = tools.invoke(request, &wait).await {
                    // The driver may have finished; the result is then dropped.
                    let _ = results.send(result);
                }
            }
            .in_current_span(),
        );
    }

    async fn on_tool_result(&mut self, result: ToolCallResult) -> Option<Outcome> {
        if let Some(entry) = self.tool_calls.get(&result.call_id) {
            self.patch(&entry.message_id, MessagePatch::SetToolResult(result.clone()));
        }

        let cancel = self.cancel.clone();
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(Outcome::Cancelled),
            submitted = self.deps.transport.submit_tool_result(&self.turn_id, &result) => submitted,
        };
        if let Err(e) = submitted {
            return Some(Outcome::transport(format!("submitting tool result: {e}")));
        }

        self.transition(Signal::ToolResult { id: result.call_id });
        None
    }

    /// A result reported by the server (a server-side tool, or the echo of
    /// one submitted from here).  The first result recorded for a call wins.
    fn record_remote_result(&mut self, id: String, result: Option<Value>, error: Option<String>) {
        let Some(entry) = self.tool_calls.get(&id) else {
            tracing::debug!(call_id = %id, "result for a tool call this turn did not request");
            return;
        };
        let result = match error {
            Some(message) => {
                ToolCallResult::failure(&id, &entry.tool_name, ToolFailureKind::Remote, message)
            }
            None => ToolCallResult::success(&id, &entry.tool_name, result.unwrap_or(Value::Null)),
        };
        self.patch(&entry.message_id, MessagePatch::SetToolResult(result));
    }

    // ── finish ─────────────────────────────────────────────────────

    async fn finish(mut self, outcome: Outcome) {
        let state = outcome.state();
        self.machine.on(outcome.signal());

        match outcome {
            Outcome::Complete => {
                if let Some(assembler) = self
                    .component
                    .as_mut()
                    .and_then(|c| c.assembler.as_mut())
                {
                    assembler.finish();
                }
                self.publish_component();
            }
            Outcome::Cancelled => {
                if let Err(e) = self.deps.transport.cancel_turn(&self.turn_id).await {
                    tracing::warn!(error = %e, "failed to tell the transport about the cancellation");
                }
            }
            Outcome::Failed { .. } => {}
        }

        let reason = outcome.reason();
        match self
            .deps
            .store
            .finish_turn(&self.thread_id, &self.turn_id, state, reason.clone())
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!("turn was already finished from outside"),
            Err(e) => tracing::warn!(error = %e, "failed to record turn outcome"),
        }

        // Releases outstanding tool waits; their results are discarded.
        self.cancel.cancel();
        self.deps.turns.remove(&self.thread_id, &self.turn_id);

        let duration_ms = self.started.elapsed().as_millis() as u64;
        match &reason {
            Some(reason) => tracing::warn!(
                state = %state,
                reason = %reason,
                events = self.events,
                duration_ms,
                "turn finished"
            ),
            None => tracing::info!(
                state = %state,
                events = self.events,
                duration_ms,
                "turn finished"
            ),
        }
        TraceEvent::TurnFinished {
            thread_id: self.thread_id.clone(),
            turn_id: self.turn_id.to_string(),
            state: state.to_string(),
            reason,
            events: self.events,
            duration_ms,
        }
        .emit();
    }
}
