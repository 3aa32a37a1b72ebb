use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Threads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    /// Opaque discriminator (user, session) that scopes every thread.
    #[serde(default = "d_context_key")]
    pub context_key: String,
    /// Directory for local state (drafts).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            context_key: d_context_key(),
            state_path: d_state_path(),
        }
    }
}

fn d_context_key() -> String {
    "default".into()
}
fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}
