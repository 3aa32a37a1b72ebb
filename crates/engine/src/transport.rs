//! The seam between the engine and whatever carries turns to the agent.
//!
//! The engine never speaks HTTP itself.  A [`Transport`] starts a turn and
//! hands back the ordered event stream for it; tool results produced locally
//! are reported back through the same transport.  Dropping the stream is
//! enough to stop delivery; [`Transport::cancel_turn`] lets implementations
//! tell the server as well.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use gl_capabilities::CapabilityDescriptor;
use gl_domain::error::{Error, Result};
use gl_domain::message::Message;
use gl_domain::stream::{BoxStream, StreamEvent};
use gl_domain::tool::ToolCallResult;
use gl_domain::turn::TurnId;

/// Everything the server needs to run one turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRequest {
    pub thread_id: String,
    pub turn_id: TurnId,
    pub context_key: String,
    /// The user's message, still carrying its idempotency token.
    pub message: Message,
    /// Capabilities advertised to the agent for this turn.
    pub capabilities: Vec<CapabilityDescriptor>,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a turn and return its event stream.  The stream ends after
    /// the server closes the turn; an `Err` item is a transport failure.
    async fn start_turn(&self, request: TurnRequest) -> Result<EventStream>;

    /// Report the result of a locally executed tool call.
    async fn submit_tool_result(&self, turn_id: &TurnId, result: &ToolCallResult) -> Result<()>;

    /// Ask the server to stop working on a turn.
    async fn cancel_turn(&self, _turn_id: &TurnId) -> Result<()> {
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replay transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One recorded step of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStep {
    Event(StreamEvent),
    /// Hold the stream until the client has submitted a result for the call,
    /// the way a live server waits for a client-side tool.
    AwaitToolResult(String),
    /// The connection drops here.
    Fail(String),
}

/// Directive lines a recording may contain besides plain events.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Directive {
    AwaitToolResult { id: String },
    TransportError { reason: String },
}

impl ReplayStep {
    /// Parse one line of a JSONL recording.
    pub fn parse(line: &str) -> Result<Self> {
        if let Ok(directive) = serde_json::from_str::<Directive>(line) {
            return Ok(match directive {
                Directive::AwaitToolResult { id } => Self::AwaitToolResult(id),
                Directive::TransportError { reason } => Self::Fail(reason),
            });
        }
        StreamEvent::parse(line).map(Self::Event)
    }
}

#[derive(Default)]
struct ReplayLog {
    requests: Mutex<Vec<TurnRequest>>,
    submitted: Mutex<Vec<(TurnId, ToolCallResult)>>,
    cancelled: Mutex<Vec<TurnId>>,
    submitted_notify: Notify,
}

impl ReplayLog {
    async fn wait_for_result(&self, call_id: &str) {
        loop {
            let notified = self.submitted_notify.notified();
            if self
                .submitted
                .lock()
                .iter()
                .any(|(_, result)| result.call_id == call_id)
            {
                return;
            }
            notified.await;
        }
    }
}

/// Plays back recorded turns, one recording per `start_turn` call.
///
/// Used by the `glint replay` command and by tests in place of a live
/// server.  Everything the engine sends is recorded for inspection.
pub struct ReplayTransport {
    turns: Mutex<VecDeque<Vec<ReplayStep>>>,
    pace: Option<Duration>,
    hold_open: bool,
    log: Arc<ReplayLog>,
}

impl Default for ReplayTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            pace: None,
            hold_open: false,
            log: Arc::new(ReplayLog::default()),
        }
    }

    /// Queue a turn made of plain events.
    pub fn with_turn(self, events: impl IntoIterator<Item = StreamEvent>) -> Self {
        self.with_steps(events.into_iter().map(ReplayStep::Event))
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = ReplayStep>) -> Self {
        self.turns.lock().push_back(steps.into_iter().collect());
        self
    }

    /// Wait this long before every step.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Keep each stream open after its last recorded step, as if the server
    /// were still working on the turn.
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// A single turn from a JSONL recording.  Blank lines and lines starting
    /// with `#` are skipped.
    pub fn from_jsonl(raw: &str) -> Result<Self> {
        let steps = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with('#')
            })
            .map(|(n, line)| {
                ReplayStep::parse(line.trim())
                    .map_err(|e| Error::Other(format!("line {}: {e}", n + 1)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new().with_steps(steps))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_jsonl(&raw)
    }

    /// Recordings not yet played.
    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.log.requests.lock().clone()
    }

    pub fn submitted(&self) -> Vec<(TurnId, ToolCallResult)> {
        self.log.submitted.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<TurnId> {
        self.log.cancelled.lock().clone()
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn start_turn(&self, request: TurnRequest) -> Result<EventStream> {
        let steps = self
            .turns
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Transport("no recorded turn left to replay".into()))?;
        tracing::debug!(turn_id = %request.turn_id, steps = steps.len(), "replaying turn");
        self.log.requests.lock().push(request);

        let log = Arc::clone(&self.log);
        let pace = self.pace;
        let hold_open = self.hold_open;

        let stream = async_stream::stream! {
            let mut failed = false;
            for step in steps {
                if let Some(pace) = pace {
                    tokio::time::sleep(pace).await;
                }
                match step {
                    ReplayStep::Event(event) => {
                        yield Ok(event);
                    }
                    ReplayStep::AwaitToolResult(call_id) => {
                        log.wait_for_result(&call_id).await;
                    }
                    ReplayStep::Fail(reason) => {
                        yield Err(Error::Transport(reason));
                        failed = true;
                        break;
                    }
                }
            }
            if hold_open && !failed {
                std::future::pending::<()>().await;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn submit_tool_result(&self, turn_id: &TurnId, result: &ToolCallResult) -> Result<()> {
        self.log
            .submitted
            .lock()
            .push((turn_id.clone(), result.clone()));
        self.log.submitted_notify.notify_waiters();
        Ok(())
    }

    async fn cancel_turn(&self, turn_id: &TurnId) -> Result<()> {
        self.log.cancelled.lock().push(turn_id.clone());
        Ok(())
    }
}
