//! Shared types for the Glint streaming session engine: the conversation
//! data model, the inbound event wire format, configuration, the error
//! taxonomy and structured trace events.

pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod tool;
pub mod trace;
pub mod turn;

pub use error::{Error, Result};
