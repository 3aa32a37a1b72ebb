use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools (local tool execution)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the tool coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Hard timeout per tool call (milliseconds).
    #[serde(default = "d_30000")]
    pub timeout_ms: u64,
    /// Finished results kept for coalescing duplicate requests.
    #[serde(default = "d_512")]
    pub max_cached_results: usize,
    /// Longest failure message reported back to the agent.
    #[serde(default = "d_240")]
    pub max_error_chars: usize,
    /// Log every tool invocation at INFO level.
    #[serde(default = "d_true")]
    pub audit_log: bool,
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_cached_results: 512,
            max_error_chars: 240,
            audit_log: true,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_30000() -> u64 {
    30_000
}
fn d_512() -> usize {
    512
}
fn d_240() -> usize {
    240
}
fn d_true() -> bool {
    true
}
