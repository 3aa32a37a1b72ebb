use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gl_capabilities::{tool_fn, CapabilityRegistry, ToolDefinition, ToolError};
use gl_domain::config::ToolsConfig;
use gl_domain::tool::{ToolCallRequest, ToolFailureKind, ToolOutcome};
use gl_tools::ToolCoordinator;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn search_tool(calls: Arc<AtomicUsize>, delay: Duration) -> ToolDefinition {
    ToolDefinition {
        name: "search".into(),
        description: "Search the catalogue".into(),
        input_schema: json!({
            "type": "object",
            "properties": { "query": { "type": "string", "minLength": 1 } },
            "required": ["query"]
        }),
        output_schema: Some(json!({ "type": "array" })),
        handler: tool_fn(move |args: Value| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok::<_, ToolError>(json!([args["query"]]))
            }
        }),
    }
}

fn coordinator_with(def: ToolDefinition, config: ToolsConfig) -> ToolCoordinator {
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register_tool(def).unwrap();
    ToolCoordinator::new(registry, config)
}

fn request(id: &str, args: Value) -> ToolCallRequest {
    ToolCallRequest {
        call_id: id.into(),
        tool_name: "search".into(),
        arguments: args,
    }
}

#[tokio::test]
async fn valid_call_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let coord = coordinator_with(search_tool(calls.clone(), Duration::ZERO), ToolsConfig::default());
    let result = coord
        .invoke(request("c1", json!({ "query": "rust" })), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.outcome, ToolOutcome::Success { value: json!(["rust"]) });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_query_is_a_validation_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let coord = coordinator_with(search_tool(calls.clone(), Duration::ZERO), ToolsConfig::default());
    let result = coord
        .invoke(request("c1", json!({ "query": "" })), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.failure_kind(), Some(ToolFailureKind::Validation));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.to_wire()["kind"], "validation");
}

#[tokio::test]
async fn unknown_tool_is_a_failed_result() {
    let coord = ToolCoordinator::new(Arc::new(CapabilityRegistry::new()), ToolsConfig::default());
    let result = coord
        .invoke(request("c1", json!({})), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.failure_kind(), Some(ToolFailureKind::NotFound));
}

#[tokio::test(start_paused = true)]
async fn duplicate_call_ids_execute_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let coord = coordinator_with(
        search_tool(calls.clone(), Duration::from_millis(50)),
        ToolsConfig::default(),
    );
    let token = CancellationToken::new();

    let (a, b) = tokio::join!(
        coord.invoke(request("dup", json!({ "query": "x" })), &token),
        coord.invoke(request("dup", json!({ "query": "x" })), &token),
    );
    assert_eq!(a, b);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A redelivery after completion is served from the result table.
    let c = coord.invoke(request("dup", json!({ "query": "x" })), &token).await;
    assert_eq!(c, a);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coord.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_tool_times_out() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = ToolsConfig {
        timeout_ms: 100,
        ..ToolsConfig::default()
    };
    let coord = coordinator_with(search_tool(calls, Duration::from_secs(5)), config);
    let result = coord
        .invoke(request("slow", json!({ "query": "x" })), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.failure_kind(), Some(ToolFailureKind::Timeout));

    // The late return does not replace the recorded timeout.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        coord.cached("slow").unwrap().failure_kind(),
        Some(ToolFailureKind::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_returns_none_and_execution_finishes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let coord = coordinator_with(
        search_tool(calls.clone(), Duration::from_millis(200)),
        ToolsConfig::default(),
    );
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let result = coord.invoke(request("c1", json!({ "query": "x" })), &token).await;
    assert!(result.is_none());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!coord.cached("c1").unwrap().is_error());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panics_and_errors_are_sanitized() {
    let registry = Arc::new(CapabilityRegistry::new());
    registry
        .register_tool(ToolDefinition {
            name: "explode".into(),
            description: String::new(),
            input_schema: json!({ "type": "object" }),
            output_schema: None,
            handler: tool_fn(|_| async {
                if true {
                    panic!("boom at /srv/app/src/tools.rs");
                }
                Ok::<_, ToolError>(Value::Null)
            }),
        })
        .unwrap();
    registry
        .register_tool(ToolDefinition {
            name: "fail".into(),
            description: String::new(),
            input_schema: json!({ "type": "object" }),
            output_schema: None,
            handler: tool_fn(|_| async {
                Err::<Value, ToolError>("disk full writing /var/lib/app/db\nbacktrace...".into())
            }),
        })
        .unwrap();
    let coord = ToolCoordinator::new(registry, ToolsConfig::default());
    let token = CancellationToken::new();

    let panicked = coord
        .invoke(
            ToolCallRequest {
                call_id: "p".into(),
                tool_name: "explode".into(),
                arguments: json!({}),
            },
            &token,
        )
        .await
        .unwrap();
    match panicked.outcome {
        ToolOutcome::Failure { kind, message } => {
            assert_eq!(kind, ToolFailureKind::Execution);
            assert_eq!(message, "tool panicked: boom at <path>");
        }
        other => panic!("unexpected {other:?}"),
    }

    let failed = coord
        .invoke(
            ToolCallRequest {
                call_id: "f".into(),
                tool_name: "fail".into(),
                arguments: json!({}),
            },
            &token,
        )
        .await
        .unwrap();
    match failed.outcome {
        ToolOutcome::Failure { message, .. } => assert_eq!(message, "disk full writing <path>"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn output_schema_violation_is_an_execution_failure() {
    let registry = Arc::new(CapabilityRegistry::new());
    registry
        .register_tool(ToolDefinition {
            name: "count".into(),
            description: String::new(),
            input_schema: json!({ "type": "object" }),
            output_schema: Some(json!({ "type": "integer" })),
            handler: tool_fn(|_| async { Ok::<_, ToolError>(json!("seven")) }),
        })
        .unwrap();
    let coord = ToolCoordinator::new(registry, ToolsConfig::default());
    let result = coord
        .invoke(
            ToolCallRequest {
                call_id: "c".into(),
                tool_name: "count".into(),
                arguments: json!({}),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.failure_kind(), Some(ToolFailureKind::Execution));
}
