use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatehouse_contracts::{ActionRequest, CallerIdentity, Decision, Params};
use gatehouse_kernel::{ActionRegistry, PolicyEnforcer, RateLimiter};
use gatehouse_server::{
    object, ActionDispatcher, AuditLog, AuditSink, AuditWriteTool, DispatchOutcome,
    MemoryAuditSink, ToolError, ToolMap, AUDIT_WRITE,
};
use serde_json::{json, Value};

const REGISTRY: &str = r#"
actions:
  - id: "doc.echo"
    scopes_required: ["doc:read"]
    timeout_ms: 1000
    retry: 1
    idempotent: true
    input_schema:
      type: "object"
      required: ["query"]
      properties:
        query: { type: "string" }
        category: { type: "string", enum: ["policy", "rate"] }
  - id: "doc.write"
    scopes_required: ["doc:write"]
    timeout_ms: 1000
    retry: 3
    idempotent: false
  - id: "doc.slow"
    timeout_ms: 20
    retry: 0
  - id: "doc.broken"
    retry: 2
  - id: "doc.unwired"
  - id: "doc.lagging"
    timeout_ms: 20
    retry: 1
    idempotent: true
  - id: "audit.write"
    scopes_required: ["audit:write"]
    retry: 2
    idempotent: false
    input_schema:
      type: "object"
      required: ["event"]
"#;

fn caller(id: &str, scopes: &[&str]) -> CallerIdentity {
    CallerIdentity {
        id: id.to_string(),
        role: "analyst".to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
    }
}

fn request(action_id: &str, params: Value) -> ActionRequest {
    ActionRequest {
        action_id: action_id.to_string(),
        params: object(params),
        trace_id: None,
    }
}

fn echo(params: &Params) -> Result<Params, ToolError> {
    Ok(object(json!({"echo": params})))
}

struct Harness {
    dispatcher: Arc<ActionDispatcher>,
    sink: MemoryAuditSink,
}

fn harness_with(tools: ToolMap, limit: usize, sink: MemoryAuditSink) -> Harness {
    let audit = Arc::new(AuditLog::new(AuditSink::Memory(sink.clone())));
    harness_on(audit, tools, limit, sink)
}

fn harness_on(audit: Arc<AuditLog>, tools: ToolMap, limit: usize, sink: MemoryAuditSink) -> Harness {
    let registry = Arc::new(ActionRegistry::from_yaml_str(REGISTRY).unwrap());
    let limiter = Arc::new(RateLimiter::new(limit, Duration::from_secs(60)));
    Harness {
        dispatcher: Arc::new(ActionDispatcher::new(
            registry,
            PolicyEnforcer::new(limiter),
            audit,
            tools,
        )),
        sink,
    }
}

fn harness(tools: ToolMap) -> Harness {
    harness_with(tools, 10, MemoryAuditSink::new())
}

fn default_tools() -> ToolMap {
    ToolMap::new().with("doc.echo", echo).with("doc.write", echo)
}

#[tokio::test]
async fn unregistered_action_is_denied_with_raw_params() {
    let h = harness(default_tools());
    let outcome = h
        .dispatcher
        .dispatch(
            &caller("u1", &["doc:read"]),
            request("doc.delete", json!({"note": "mail bob@example.com"})),
        )
        .await;

    assert_eq!(outcome.reason(), Some("action_not_registered"));
    assert!(matches!(outcome, DispatchOutcome::Denied { .. }));
    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Deny);
    assert_eq!(events[0].params["note"], "mail bob@example.com");
    assert_eq!(events[0].result, None);
}

#[tokio::test]
async fn missing_scope_is_denied_with_raw_params() {
    let h = harness(default_tools());
    let outcome = h
        .dispatcher
        .dispatch(
            &caller("u2", &[]),
            request("doc.echo", json!({"query": "call 010-1234-5678"})),
        )
        .await;

    assert_eq!(outcome.reason(), Some("missing_scopes: required=[doc:read]"));
    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].params["query"], "call 010-1234-5678");
}

#[tokio::test]
async fn schema_violations_are_denied() {
    let h = harness(default_tools());
    let reader = caller("u1", &["doc:read"]);

    let outcome = h
        .dispatcher
        .dispatch(&reader, request("doc.echo", json!({"top_k": 3})))
        .await;
    assert_eq!(
        outcome.reason(),
        Some("schema_invalid: missing_required_field: query")
    );

    let outcome = h
        .dispatcher
        .dispatch(
            &reader,
            request("doc.echo", json!({"query": "x", "category": "secret"})),
        )
        .await;
    let reason = outcome.reason().unwrap();
    assert!(reason.starts_with("schema_invalid: value_not_allowed: key=category"));
    assert_eq!(h.sink.len().await, 2);
}

#[tokio::test]
async fn missing_handler_is_denied_with_sanitized_params() {
    let h = harness(default_tools());
    let outcome = h
        .dispatcher
        .dispatch(
            &caller("u1", &[]),
            request("doc.unwired", json!({"contact": "jane.doe@example.com"})),
        )
        .await;

    assert_eq!(outcome.reason(), Some("tool_not_implemented"));
    let events = h.sink.events().await;
    assert_eq!(events[0].decision, Decision::Deny);
    assert_eq!(events[0].params["contact"], "<EMAIL_MASKED>");
}

#[tokio::test]
async fn permitted_call_sees_and_audits_sanitized_params() {
    let h = harness(default_tools());
    let outcome = h
        .dispatcher
        .dispatch(
            &caller("u1", &["doc:read"]),
            ActionRequest {
                action_id: "doc.echo".to_string(),
                params: object(json!({"query": "id 900101-1234567", "top_k": 3})),
                trace_id: Some("trace-fixed".to_string()),
            },
        )
        .await;

    let DispatchOutcome::Completed {
        trace_id, result, ..
    } = outcome
    else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(trace_id, "trace-fixed");
    assert_eq!(result["echo"]["query"], "id 900101-*******");
    assert_eq!(result["echo"]["top_k"], 3);

    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].trace_id, "trace-fixed");
    assert_eq!(events[0].decision, Decision::Permit);
    assert_eq!(events[0].reason, None);
    assert_eq!(events[0].params["query"], "id 900101-*******");
    assert_eq!(events[0].result.as_ref().unwrap()["echo"]["top_k"], 3);
}

#[tokio::test]
async fn generated_trace_ids_are_unique() {
    let h = harness(default_tools());
    let reader = caller("u1", &["doc:read"]);
    let a = h
        .dispatcher
        .dispatch(&reader, request("doc.echo", json!({"query": "a"})))
        .await;
    let b = h
        .dispatcher
        .dispatch(&reader, request("doc.echo", json!({"query": "b"})))
        .await;
    assert!(!a.trace_id().is_empty());
    assert_ne!(a.trace_id(), b.trace_id());
}

#[tokio::test]
async fn eleventh_call_in_window_is_rate_limited() {
    let h = harness(default_tools());
    let reader = caller("u-burst", &["doc:read"]);
    for _ in 0..10 {
        let outcome = h
            .dispatcher
            .dispatch(&reader, request("doc.echo", json!({"query": "q"})))
            .await;
        assert!(outcome.is_completed());
    }
    let outcome = h
        .dispatcher
        .dispatch(&reader, request("doc.echo", json!({"query": "q"})))
        .await;
    assert_eq!(outcome.reason(), Some("rate_limit_exceeded"));

    let other = h
        .dispatcher
        .dispatch(
            &caller("u-other", &["doc:read"]),
            request("doc.echo", json!({"query": "q"})),
        )
        .await;
    assert!(other.is_completed());
    assert_eq!(h.sink.len().await, 12);
}

#[tokio::test]
async fn transient_failure_is_retried_for_idempotent_actions() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = move |params: &Params| -> Result<Params, ToolError> {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ToolError::Transient("connection reset".to_string()))
        } else {
            echo(params)
        }
    };
    let h = harness(ToolMap::new().with("doc.echo", flaky));

    let outcome = h
        .dispatcher
        .dispatch(
            &caller("u1", &["doc:read"]),
            request("doc.echo", json!({"query": "q"})),
        )
        .await;
    assert!(outcome.is_completed());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.len().await, 1);
}

#[tokio::test]
async fn non_idempotent_action_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let failing = move |_: &Params| -> Result<Params, ToolError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::Transient("upstream busy".to_string()))
    };
    let h = harness(ToolMap::new().with("doc.write", failing));

    let outcome = h
        .dispatcher
        .dispatch(&caller("u1", &["doc:write"]), request("doc.write", json!({})))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert_eq!(
        outcome.reason(),
        Some("tool_execution_failed: transient failure: upstream busy")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permanent_failure_is_not_retried_and_is_audited_as_permit() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let broken = move |_: &Params| -> Result<Params, ToolError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::Permanent("index missing".to_string()))
    };
    let h = harness(ToolMap::new().with("doc.broken", broken));

    let outcome = h
        .dispatcher
        .dispatch(&caller("u1", &[]), request("doc.broken", json!({})))
        .await;
    assert_eq!(outcome.reason(), Some("tool_execution_failed: index missing"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].decision, Decision::Permit);
    assert_eq!(events[0].result.as_ref().unwrap()["error"], "index missing");
}

#[tokio::test]
async fn slow_handler_times_out() {
    let slow = |params: &Params| -> Result<Params, ToolError> {
        std::thread::sleep(Duration::from_millis(200));
        echo(params)
    };
    let h = harness(ToolMap::new().with("doc.slow", slow));

    let outcome = h
        .dispatcher
        .dispatch(&caller("u1", &[]), request("doc.slow", json!({})))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert_eq!(outcome.reason(), Some("tool_timeout"));
    let events = h.sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason.as_deref(), Some("tool_timeout"));
}

#[tokio::test]
async fn audit_sink_failure_does_not_change_outcome() {
    let h = harness_with(default_tools(), 10, MemoryAuditSink::with_capacity(0));
    let outcome = h
        .dispatcher
        .dispatch(
            &caller("u1", &["doc:read"]),
            request("doc.echo", json!({"query": "q"})),
        )
        .await;

    assert!(outcome.is_completed());
    let health = h.dispatcher.audit().health();
    assert_eq!(health.recorded, 0);
    assert_eq!(health.failures, 1);
    assert!(health.last_error.unwrap().contains("capacity 0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_each_produce_one_event() {
    let h = harness_with(default_tools(), 5, MemoryAuditSink::new());
    let mut handles = Vec::new();
    for i in 0..40 {
        let dispatcher = Arc::clone(&h.dispatcher);
        handles.push(tokio::spawn(async move {
            let who = caller(&format!("u{}", i % 4), &["doc:read"]);
            dispatcher
                .dispatch(&who, request("doc.echo", json!({"query": "q"})))
                .await
        }));
    }

    let mut completed = 0;
    let mut limited = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        match outcome.reason() {
            None => completed += 1,
            Some("rate_limit_exceeded") => limited += 1,
            Some(other) => panic!("unexpected reason {other}"),
        }
    }

    assert_eq!(completed, 20);
    assert_eq!(limited, 20);
    assert_eq!(h.sink.len().await, 40);
}

#[tokio::test]
async fn timed_out_idempotent_call_is_retried_after_a_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let lagging = move |params: &Params| -> Result<Params, ToolError> {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        echo(params)
    };
    let h = harness(ToolMap::new().with("doc.lagging", lagging));

    let started = Instant::now();
    let outcome = h
        .dispatcher
        .dispatch(&caller("u1", &[]), request("doc.lagging", json!({})))
        .await;
    assert_eq!(outcome.reason(), Some("tool_timeout"));
    // Two 20 ms attempts plus the 50 ms pause between them.
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audit_write_reaches_the_sink_masked_and_is_itself_audited() {
    let sink = MemoryAuditSink::new();
    let audit = Arc::new(AuditLog::new(AuditSink::Memory(sink.clone())));
    let tools = ToolMap::new().with(AUDIT_WRITE, AuditWriteTool::new(Arc::clone(&audit)));
    let h = harness_on(audit, tools, 10, sink);

    let outcome = h
        .dispatcher
        .dispatch(
            &caller("batch-1", &["audit:write"]),
            request(
                "audit.write",
                json!({"event": {
                    "ts": 1_700_000_000_000i64,
                    "trace_id": "external-7",
                    "user_id": "batch-1",
                    "action_id": "doc.export",
                    "decision": "PERMIT",
                    "reason": null,
                    "params": {"note": "call 010-1234-5678", "owner": {"email": "bob@example.com"}}
                }}),
            ),
        )
        .await;
    assert!(outcome.is_completed(), "{outcome:?}");

    let events = h.sink.events().await;
    assert_eq!(events.len(), 2);

    let written = &events[0];
    assert_eq!(written.trace_id, "external-7");
    assert_eq!(written.action_id, "doc.export");
    assert_eq!(written.params["note"], "call 010-****-5678");
    assert_eq!(written.params["owner"]["email"], "<EMAIL_MASKED>");

    let own = &events[1];
    assert_eq!(own.action_id, "audit.write");
    assert_eq!(own.user_id, "batch-1");
    assert_eq!(own.decision, Decision::Permit);
    assert_eq!(own.result.as_ref().unwrap()["ok"], true);
    assert_eq!(h.dispatcher.audit().health().recorded, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_audit_write_fails_without_retry() {
    let sink = MemoryAuditSink::new();
    let audit = Arc::new(AuditLog::new(AuditSink::Memory(sink.clone())));
    let tools = ToolMap::new().with(AUDIT_WRITE, AuditWriteTool::new(Arc::clone(&audit)));
    let h = harness_on(audit, tools, 10, sink);

    let outcome = h
        .dispatcher
        .dispatch(
            &caller("batch-1", &["audit:write"]),
            request("audit.write", json!({"event": {"trace_id": "t"}})),
        )
        .await;
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert!(outcome
        .reason()
        .unwrap()
        .starts_with("tool_execution_failed: event is not a valid audit event"));
    assert_eq!(h.sink.len().await, 1);
}
