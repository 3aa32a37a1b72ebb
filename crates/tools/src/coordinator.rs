//! Tool call coordination.
//!
//! Every call runs on its own spawned task so that a caller giving up (the
//! turn was cancelled) never aborts an execution half way; the result is
//! still recorded and simply not delivered.  Duplicate deliveries of the
//! same call id share one execution:
//!
//! - while it is running, through a [`Shared`] future over its task;
//! - after it finished, from a bounded table of recent results.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use gl_capabilities::CapabilityRegistry;
use gl_domain::config::ToolsConfig;
use gl_domain::tool::{ToolCallRequest, ToolCallResult, ToolFailureKind, ToolOutcome};
use gl_domain::trace::TraceEvent;

use crate::sanitize::sanitize_error;

type SharedCall = Shared<BoxFuture<'static, ToolCallResult>>;

#[derive(Default)]
struct CallTable {
    inflight: HashMap<String, SharedCall>,
    finished: HashMap<String, ToolCallResult>,
    /// Finished call ids, oldest first.
    order: VecDeque<String>,
}

impl CallTable {
    fn record(&mut self, result: ToolCallResult, cap: usize) {
        self.inflight.remove(&result.call_id);
        if self.finished.contains_key(&result.call_id) {
            return;
        }
        self.order.push_back(result.call_id.clone());
        self.finished.insert(result.call_id.clone(), result);
        while self.order.len() > cap.max(1) {
            if let Some(evicted) = self.order.pop_front() {
                self.finished.remove(&evicted);
            }
        }
    }
}

pub struct ToolCoordinator {
    registry: Arc<CapabilityRegistry>,
    config: ToolsConfig,
    calls: Arc<Mutex<CallTable>>,
}

impl ToolCoordinator {
    pub fn new(registry: Arc<CapabilityRegistry>, config: ToolsConfig) -> Self {
        Self {
            registry,
            config,
            calls: Arc::new(Mutex::new(CallTable::default())),
        }
    }

    /// Run (or join) the call and wait for its result.
    ///
    /// Returns `None` when `cancel` fires first.  The execution keeps
    /// running and its result is kept for later duplicates.
    pub async fn invoke(
        &self,
        request: ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Option<ToolCallResult> {
        let call_id = request.call_id.clone();
        let call = self.call_for(request);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(call_id = %call_id, "tool wait cancelled; result will be discarded");
                None
            }
            result = call => Some(result),
        }
    }

    /// Finished result for `call_id`, if still cached.
    pub fn cached(&self, call_id: &str) -> Option<ToolCallResult> {
        self.calls.lock().finished.get(call_id).cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.calls.lock().inflight.len()
    }

    fn call_for(&self, request: ToolCallRequest) -> SharedCall {
        let mut calls = self.calls.lock();

        if let Some(done) = calls.finished.get(&request.call_id) {
            TraceEvent::ToolCallCoalesced {
                call_id: request.call_id.clone(),
            }
            .emit();
            return futures_util::future::ready(done.clone()).boxed().shared();
        }
        if let Some(running) = calls.inflight.get(&request.call_id) {
            TraceEvent::ToolCallCoalesced {
                call_id: request.call_id.clone(),
            }
            .emit();
            return running.clone();
        }

        let key = request.call_id.clone();
        let call_id = request.call_id.clone();
        let tool_name = request.tool_name.clone();
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let table = Arc::clone(&self.calls);

        // The table lock is held until the entry is inserted, so the task
        // cannot record its result before it is registered as in flight.
        let task = tokio::spawn(async move {
            let result = run_call(&registry, &config, request).await;
            table.lock().record(result.clone(), config.max_cached_results);
            result
        });

        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => ToolCallResult::failure(
                    call_id,
                    tool_name,
                    ToolFailureKind::Execution,
                    format!("tool task ended unexpectedly: {e}"),
                ),
            }
        }
        .boxed()
        .shared();

        calls.inflight.insert(key, shared.clone());
        shared
    }
}

async fn run_call(
    registry: &CapabilityRegistry,
    config: &ToolsConfig,
    request: ToolCallRequest,
) -> ToolCallResult {
    let started = Instant::now();
    let result = execute(registry, config, &request).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = match &result.outcome {
        ToolOutcome::Success { .. } => "success",
        ToolOutcome::Failure { kind, .. } => kind.as_str(),
    };
    if config.audit_log {
        tracing::info!(
            call_id = %request.call_id,
            tool = %request.tool_name,
            outcome = %outcome,
            duration_ms,
            "tool invoked"
        );
    }
    TraceEvent::ToolInvoked {
        call_id: request.call_id.clone(),
        tool: request.tool_name.clone(),
        outcome: outcome.to_owned(),
        duration_ms,
    }
    .emit();
    result
}

async fn execute(
    registry: &CapabilityRegistry,
    config: &ToolsConfig,
    request: &ToolCallRequest,
) -> ToolCallResult {
    let fail = |kind: ToolFailureKind, message: String| {
        ToolCallResult::failure(&request.call_id, &request.tool_name, kind, message)
    };

    let Ok(tool) = registry.resolve_tool(&request.tool_name) else {
        return fail(
            ToolFailureKind::NotFound,
            format!("tool `{}` is not registered", request.tool_name),
        );
    };

    if let Err(errors) = tool.input.validate(&request.arguments) {
        return fail(
            ToolFailureKind::Validation,
            format!("invalid arguments: {}", errors.join("; ")),
        );
    }

    let handler = tool.handler();
    let args = request.arguments.clone();
    // A separate task isolates panics in the implementation.
    let execution = tokio::spawn(async move { handler.execute(args).await });

    let value = match tokio::time::timeout(config.timeout(), execution).await {
        Err(_) => {
            tracing::warn!(
                call_id = %request.call_id,
                tool = %request.tool_name,
                timeout_ms = config.timeout_ms,
                "tool timed out; a late result will be discarded"
            );
            return fail(
                ToolFailureKind::Timeout,
                format!("timed out after {} ms", config.timeout_ms),
            );
        }
        Ok(Err(join)) => {
            return fail(
                ToolFailureKind::Execution,
                sanitize_error(&panic_message(join), config.max_error_chars),
            );
        }
        Ok(Ok(Err(e))) => {
            return fail(
                ToolFailureKind::Execution,
                sanitize_error(&e.to_string(), config.max_error_chars),
            );
        }
        Ok(Ok(Ok(value))) => value,
    };

    if let Some(output) = &tool.output {
        if let Err(errors) = output.validate(&value) {
            return fail(
                ToolFailureKind::Execution,
                sanitize_error(
                    &format!("output does not match schema: {}", errors.join("; ")),
                    config.max_error_chars,
                ),
            );
        }
    }
    ToolCallResult::success(&request.call_id, &request.tool_name, value)
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "tool execution was aborted".into();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("tool panicked: {detail}")
}
