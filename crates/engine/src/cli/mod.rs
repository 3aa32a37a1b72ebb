pub mod config;
pub mod replay;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use gl_domain::config::GlintConfig;

/// Glint: streaming session engine for agent-driven user interfaces.
#[derive(Debug, Parser)]
#[command(name = "glint", version, about)]
pub struct Cli {
    /// Emit logs as JSON lines instead of the compact format.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drive a recorded turn (JSONL events) through the engine and print
    /// the resulting thread.
    Replay {
        /// Path to the recording.
        path: PathBuf,
        /// The user message that starts the turn.
        #[arg(long, default_value = "replay")]
        message: String,
        /// Print the thread as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path named by `GLINT_CONFIG` (or
/// `glint.toml` by default).  Returns the parsed [`GlintConfig`] and the
/// path that was used.
pub fn load_config() -> anyhow::Result<(GlintConfig, String)> {
    let config_path = std::env::var("GLINT_CONFIG").unwrap_or_else(|_| "glint.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        GlintConfig::from_toml(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        GlintConfig::default()
    };

    Ok((config, config_path))
}
