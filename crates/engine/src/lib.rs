//! Glint session engine.
//!
//! Consumes the event stream of in-progress agent turns through a
//! [`Transport`] and turns it into thread state that any number of
//! front-end bindings can subscribe to.

pub mod adapters;
pub mod cli;
pub mod engine;
pub mod runtime;
pub mod transport;

pub use engine::Engine;
pub use transport::{EventStream, ReplayStep, ReplayTransport, Transport, TurnRequest};
