use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gl_domain::config::{LogFormat, ObservabilityConfig};
use gl_engine::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Replay {
            path,
            message,
            json,
        }) => {
            let (config, _) = gl_engine::cli::load_config()?;
            init_tracing(&config.observability, cli.json_logs);
            gl_engine::cli::replay::replay(&config, &path, message, json).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = gl_engine::cli::load_config()?;
            if !gl_engine::cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _) = gl_engine::cli::load_config()?;
            gl_engine::cli::config::show(&config)
        }
        None | Some(Command::Version) => {
            println!("glint {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Logs go to stderr so command output on stdout stays clean.  `RUST_LOG`
/// overrides the configured filter.
fn init_tracing(obs: &ObservabilityConfig, json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&obs.filter));

    if json_logs || obs.format == LogFormat::Json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}
