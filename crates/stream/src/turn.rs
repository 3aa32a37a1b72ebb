//! Turn lifecycle.
//!
//! ```text
//! idle ─start→ submitting ─→ thinking ⇄ generating_text
//!                               ⇅            ⇅
//!                   selecting_component  awaiting_tool_result
//!                               ↓
//!                 complete | cancelled | error ─retire→ idle
//! ```
//!
//! Terminal states absorb every signal except `turn-closed`.

use std::collections::HashSet;

use gl_domain::stream::StreamEvent;
use gl_domain::turn::TurnState;

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    TurnStarted,
    ReasoningStep,
    TextDelta,
    ComponentSelected,
    ArgumentFragment,
    FieldComplete,
    ToolCallRequested { id: String },
    ToolResult { id: String },
    TurnComplete,
    TurnError,
    /// The transport stream failed or ended without a terminal event.
    TransportFailure,
    /// The user cancelled.
    Cancel,
    TurnClosed,
}

impl Signal {
    /// Signal carried by a transport event.  Events that do not affect the
    /// turn lifecycle map to `None`.
    pub fn from_event(event: &StreamEvent) -> Option<Self> {
        Some(match event {
            StreamEvent::TurnStarted { .. } => Self::TurnStarted,
            StreamEvent::TextDelta { .. } => Self::TextDelta,
            StreamEvent::ComponentSelected { .. } => Self::ComponentSelected,
            StreamEvent::ArgumentFragment { .. } => Self::ArgumentFragment,
            StreamEvent::FieldComplete { .. } => Self::FieldComplete,
            StreamEvent::ToolCallRequested { id, .. } => Self::ToolCallRequested { id: id.clone() },
            StreamEvent::ToolResult { id, .. } => Self::ToolResult { id: id.clone() },
            StreamEvent::ReasoningStep { .. } => Self::ReasoningStep,
            StreamEvent::TurnComplete => Self::TurnComplete,
            StreamEvent::TurnError { .. } => Self::TurnError,
            StreamEvent::TurnClosed => Self::TurnClosed,
            StreamEvent::MessageAcknowledged { .. } | StreamEvent::Unknown => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot start a turn while {0}")]
pub struct NotIdle(pub TurnState);

#[derive(Debug, Default)]
pub struct TurnMachine {
    state: TurnState,
    outstanding: HashSet<String>,
    closed: bool,
}

impl TurnMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// `idle → submitting`.
    pub fn start(&mut self) -> Result<(), NotIdle> {
        if self.state != TurnState::Idle {
            return Err(NotIdle(self.state));
        }
        self.state = TurnState::Submitting;
        self.closed = false;
        Ok(())
    }

    /// Return a terminal machine to `idle`.  No-op otherwise.
    pub fn retire(&mut self) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        self.state = TurnState::Idle;
        self.outstanding.clear();
        self.closed = false;
        true
    }

    /// Feed one signal.  Returns the new state when it changed.
    pub fn on(&mut self, signal: Signal) -> Option<TurnState> {
        if signal == Signal::TurnClosed {
            self.closed = true;
            return None;
        }
        if !self.state.is_active() {
            tracing::trace!(state = %self.state, ?signal, "signal absorbed");
            return None;
        }

        let next = match signal {
            Signal::TurnStarted | Signal::ReasoningStep => TurnState::Thinking,
            Signal::TextDelta => TurnState::GeneratingText,
            Signal::ComponentSelected | Signal::ArgumentFragment | Signal::FieldComplete => {
                TurnState::SelectingComponent
            }
            Signal::ToolCallRequested { id } => {
                self.outstanding.insert(id);
                TurnState::AwaitingToolResult
            }
            Signal::ToolResult { id } => {
                self.outstanding.remove(&id);
                if self.outstanding.is_empty() {
                    TurnState::Thinking
                } else {
                    TurnState::AwaitingToolResult
                }
            }
            Signal::TurnComplete => TurnState::Complete,
            Signal::TurnError | Signal::TransportFailure => TurnState::Error,
            Signal::Cancel => TurnState::Cancelled,
            Signal::TurnClosed => unreachable!("handled above"),
        };

        if next.is_terminal() {
            self.outstanding.clear();
        }
        if next == self.state {
            return None;
        }
        tracing::debug!(from = %self.state, to = %next, "turn transition");
        self.state = next;
        Some(next)
    }

    pub fn is_outstanding(&self, call_id: &str) -> bool {
        self.outstanding.contains(call_id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether the server acknowledged the end of the turn.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> TurnMachine {
        let mut m = TurnMachine::new();
        m.start().unwrap();
        m
    }

    #[test]
    fn start_only_from_idle() {
        let mut m = started();
        assert_eq!(m.state(), TurnState::Submitting);
        assert_eq!(m.start(), Err(NotIdle(TurnState::Submitting)));

        m.on(Signal::TurnComplete);
        assert!(m.start().is_err());
        assert!(m.retire());
        assert!(m.start().is_ok());
    }

    #[test]
    fn signal_table() {
        let mut m = started();
        assert_eq!(m.on(Signal::TurnStarted), Some(TurnState::Thinking));
        assert_eq!(m.on(Signal::TextDelta), Some(TurnState::GeneratingText));
        assert_eq!(m.on(Signal::TextDelta), None);
        assert_eq!(m.on(Signal::ComponentSelected), Some(TurnState::SelectingComponent));
        assert_eq!(m.on(Signal::ArgumentFragment), None);
        assert_eq!(m.on(Signal::ReasoningStep), Some(TurnState::Thinking));
        assert_eq!(m.on(Signal::TurnComplete), Some(TurnState::Complete));
    }

    #[test]
    fn tool_results_return_to_thinking_when_all_arrive() {
        let mut m = started();
        m.on(Signal::ToolCallRequested { id: "a".into() });
        m.on(Signal::ToolCallRequested { id: "b".into() });
        assert_eq!(m.outstanding(), 2);

        assert_eq!(m.on(Signal::ToolResult { id: "a".into() }), None);
        assert_eq!(m.state(), TurnState::AwaitingToolResult);
        assert_eq!(m.on(Signal::ToolResult { id: "b".into() }), Some(TurnState::Thinking));
    }

    #[test]
    fn cancel_from_every_active_state() {
        let drivers: Vec<Vec<Signal>> = vec![
            vec![],
            vec![Signal::TurnStarted],
            vec![Signal::TextDelta],
            vec![Signal::ComponentSelected],
            vec![Signal::ToolCallRequested { id: "x".into() }],
        ];
        for signals in drivers {
            let mut m = started();
            for s in signals {
                m.on(s);
            }
            assert_eq!(m.on(Signal::Cancel), Some(TurnState::Cancelled));
            assert_eq!(m.outstanding(), 0);
        }
    }

    #[test]
    fn terminal_absorbs_everything_but_closed() {
        let mut m = started();
        m.on(Signal::TurnError);
        assert_eq!(m.state(), TurnState::Error);
        assert_eq!(m.on(Signal::TextDelta), None);
        assert_eq!(m.on(Signal::TurnComplete), None);
        assert_eq!(m.on(Signal::Cancel), None);
        assert_eq!(m.state(), TurnState::Error);

        assert!(!m.is_closed());
        m.on(Signal::TurnClosed);
        assert!(m.is_closed());
    }

    #[test]
    fn idle_ignores_stream_signals() {
        let mut m = TurnMachine::new();
        assert_eq!(m.on(Signal::TextDelta), None);
        assert_eq!(m.state(), TurnState::Idle);
    }

    #[test]
    fn unknown_and_ack_events_carry_no_signal() {
        assert_eq!(Signal::from_event(&StreamEvent::Unknown), None);
        assert_eq!(
            Signal::from_event(&StreamEvent::TextDelta { delta: "x".into() }),
            Some(Signal::TextDelta)
        );
    }
}
