mod drafts;
mod observability;
mod threads;
mod tools;

pub use drafts::*;
pub use observability::*;
pub use threads::*;
pub use tools::*;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlintConfig {
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub drafts: DraftsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GlintConfig {
    /// Parse a TOML document.  Missing sections fall back to defaults.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, or return defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.tools.timeout_ms == 0 {
            return Err(Error::Config("tools.timeout_ms must be > 0".into()));
        }
        if self.drafts.storage_key.trim().is_empty() {
            return Err(Error::Config("drafts.storage_key must not be empty".into()));
        }
        if self.threads.context_key.trim().is_empty() {
            return Err(Error::Config("threads.context_key must not be empty".into()));
        }
        Ok(())
    }
}
