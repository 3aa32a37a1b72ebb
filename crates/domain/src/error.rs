/// Shared error type used across all Glint crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A capability definition carried a malformed schema.  Raised at
    /// registration time, never during streaming.
    #[error("schema for {name}: {message}")]
    Schema { name: String, message: String },

    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("tool {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("turn cancelled")]
    Cancelled,

    #[error("thread {0} already has an active turn")]
    TurnActive(String),

    #[error("message {0} is frozen")]
    MessageFrozen(String),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn schema(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
