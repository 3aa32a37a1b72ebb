use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use gl_domain::config::GlintConfig;
use gl_domain::message::{ContentPart, Role};
use gl_domain::tool::ToolOutcome;
use gl_threads::{MemoryDraftStorage, Thread};

use crate::engine::Engine;
use crate::transport::ReplayTransport;

/// Replay a recorded turn and print the resulting thread.
pub async fn replay(
    config: &GlintConfig,
    path: &Path,
    message: String,
    json: bool,
) -> anyhow::Result<()> {
    let transport = ReplayTransport::from_file(path)
        .with_context(|| format!("loading recording {}", path.display()))?;
    let engine = Engine::new(
        config,
        Arc::new(transport),
        Arc::new(MemoryDraftStorage::new()),
    );

    engine.send(message, Vec::new())?;
    let thread = engine.wait_idle().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&*thread)?);
    } else {
        print!("{}", render(&thread));
    }
    Ok(())
}

/// Plain-text rendering of a thread.
pub fn render(thread: &Thread) -> String {
    let mut out = String::new();
    for message in &thread.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Agent => "agent",
            Role::Tool => "tool",
        };
        let _ = write!(out, "[{role}]");
        if message.cancelled {
            out.push_str(" (cancelled)");
        }
        out.push('\n');

        for step in &message.reasoning {
            let _ = writeln!(out, "  ~ {step}");
        }
        for part in &message.parts {
            match part {
                ContentPart::Text { text } => {
                    for line in text.lines() {
                        let _ = writeln!(out, "  {line}");
                    }
                }
                ContentPart::Binary { attachment } => {
                    let _ = writeln!(out, "  [attachment {}]", attachment.reference);
                }
                ContentPart::Component(c) if !c.resolved => {
                    let _ = writeln!(out, "  <{}> (unregistered component)", c.name);
                }
                ContentPart::Component(c) => {
                    let status = serde_json::to_string(&c.status).unwrap_or_default();
                    let _ = writeln!(out, "  <{}> {} {}", c.name, c.props, status.trim_matches('"'));
                }
            }
        }
        if let Some(call) = &message.tool_call {
            let _ = writeln!(out, "  {}({})", call.tool_name, call.arguments);
        }
        if let Some(result) = &message.tool_result {
            match &result.outcome {
                ToolOutcome::Success { value } => {
                    let _ = writeln!(out, "  -> {value}");
                }
                ToolOutcome::Failure { kind, message } => {
                    let _ = writeln!(out, "  -> {} error: {message}", kind.as_str());
                }
            }
        }
        if let Some(error) = &message.error {
            let _ = writeln!(out, "  ! {error}");
        }
    }
    let _ = write!(out, "status: {}", thread.status);
    if let Some(error) = &thread.error {
        let _ = write!(out, " ({error})");
    }
    out.push('\n');
    out
}
