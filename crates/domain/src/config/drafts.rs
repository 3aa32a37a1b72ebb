use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Drafts (unsent input persistence)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftsConfig {
    /// Disable to keep drafts in memory only.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Quiet period after the last keystroke before drafts are written.
    #[serde(default = "d_300")]
    pub debounce_ms: u64,
    /// Key the serialized draft map is stored under.
    #[serde(default = "d_storage_key")]
    pub storage_key: String,
}

impl DraftsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for DraftsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 300,
            storage_key: d_storage_key(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_300() -> u64 {
    300
}
fn d_storage_key() -> String {
    "glint.drafts".into()
}
