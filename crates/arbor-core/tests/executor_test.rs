//! End-to-end executor tests over a real (temporary) database.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::time::Instant;

use arbor_core::adapter::AdapterRegistry;
use arbor_core::engine::{Engine, RunStateView};
use arbor_core::errors::ErrorCode;
use arbor_core::event::EventType;
use arbor_core::run::StartRequest;
use arbor_core::safety::SafetyLimits;
use arbor_test_utils::{Script, ScriptedAdapter, create_test_db, linear_dag_json, one_block_dag_json};

fn registry_with(adapter: Arc<ScriptedAdapter>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    registry
}

fn start_request(dag: Value, context: Value) -> StartRequest {
    StartRequest {
        dag: Some(dag),
        context: context.as_object().cloned().or_else(|| Some(Map::new())),
        ..Default::default()
    }
}

async fn wait_terminal(engine: &Engine, run_id: &str, timeout: Duration) -> RunStateView {
    let deadline = Instant::now() + timeout;
    loop {
        let view = engine.run_state(run_id).await.expect("run should exist");
        if view.status.is_terminal() {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "run {run_id} did not settle (status {:?})",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn event_types(view: &RunStateView) -> Vec<(EventType, Option<String>)> {
    view.events
        .iter()
        .map(|e| (e.event_type, e.block_id.clone()))
        .collect()
}

#[tokio::test]
async fn linear_dag_success_event_order() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::always_ok("{\"done\": true}");
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter),
        None,
    );

    let submission = engine
        .submit(start_request(
            linear_dag_json("linear"),
            json!({"prompt": "go"}),
        ))
        .await
        .unwrap();
    assert!(!submission.queued);
    assert_eq!(submission.blocks, vec!["a", "b"]);

    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;
    assert_eq!(view.status, arbor_db::models::RunStatus::Completed);

    let events = event_types(&view);
    assert_eq!(
        events,
        vec![
            (EventType::RunStart, None),
            (EventType::BlockStart, Some("a".into())),
            (EventType::BlockComplete, Some("a".into())),
            (EventType::BlockStart, Some("b".into())),
            (EventType::BlockComplete, Some("b".into())),
            (EventType::RunComplete, None),
        ]
    );

    // Sequences strictly increase.
    assert!(view.events.windows(2).all(|w| w[0].seq < w[1].seq));

    // Edge ordering invariant: a completes before b starts.
    let a_complete = view
        .events
        .iter()
        .find(|e| e.event_type == EventType::BlockComplete && e.block_id.as_deref() == Some("a"))
        .unwrap()
        .seq;
    let b_start = view
        .events
        .iter()
        .find(|e| e.event_type == EventType::BlockStart && e.block_id.as_deref() == Some("b"))
        .unwrap()
        .seq;
    assert!(a_complete < b_start);
}

#[tokio::test]
async fn upstream_failure_skips_downstream() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::new("scripted", vec![Script::Fail("boom".into())]);
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter),
        None,
    );

    let submission = engine
        .submit(start_request(
            linear_dag_json("failing"),
            json!({"prompt": "go"}),
        ))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Failed);
    assert_eq!(view.run["blocks"]["a"]["status"], "failed");
    assert_eq!(view.run["blocks"]["b"]["status"], "skipped");
    assert_eq!(
        view.run["blocks"]["a"]["error"]["code"],
        "DISPATCH_FAILED"
    );

    // Exactly one block:fail and one run:fail.
    let fails = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::BlockFail)
        .count();
    assert_eq!(fails, 1);
    assert_eq!(
        view.events.last().unwrap().event_type,
        EventType::RunFail
    );
}

#[tokio::test]
async fn missing_required_input_fails_block() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::always_ok("{}");
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter.clone()),
        None,
    );

    // No `prompt` in the context.
    let submission = engine
        .submit(start_request(linear_dag_json("no-input"), json!({})))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Failed);
    assert_eq!(view.run["blocks"]["a"]["error"]["code"], "MISSING_INPUT");
    assert_eq!(view.run["blocks"]["a"]["error"]["stage"], "input");
    assert_eq!(adapter.request_count(), 0, "nothing was dispatched");
}

#[tokio::test]
async fn post_gate_feedback_loop_exhausts_attempts() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::always_ok("{\"price\": 0}");
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter.clone()),
        None,
    );

    let dag = one_block_dag_json(
        "post-gated",
        json!({
            "post_gates": [{"type": "expression", "expr": "price > 100"}],
            "retry": {"max_attempts": 2}
        }),
    );
    let submission = engine
        .submit(start_request(dag, json!({"prompt": "sell"})))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Failed);
    let block = &view.run["blocks"]["solo"];
    assert_eq!(block["status"], "failed");
    assert_eq!(block["error"]["stage"], "post_gate");
    assert_eq!(block["error"]["code"], "GATE_EXHAUSTION");
    assert!(
        block["error"]["message"]
            .as_str()
            .unwrap()
            .contains("price > 100")
    );

    // 1 initial + 2 retries.
    assert_eq!(adapter.request_count(), 3);
    assert_eq!(block["retry_state"]["attempt"], 3);
    // Gate results accumulate per attempt.
    assert_eq!(block["post_gate_results"].as_array().unwrap().len(), 3);

    // The second request carried the first attempt's feedback.
    let requests = adapter.requests();
    assert_eq!(requests[0].bounce_count, 0);
    assert_eq!(requests[1].bounce_count, 1);
    assert!(requests[1].description.contains("price > 100"));
}

#[tokio::test]
async fn retry_cap_clamps_block_retries() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::new("scripted", vec![Script::Fail("nope".into())]);
    let limits = SafetyLimits {
        max_retries_cap: 1,
        ..Default::default()
    };
    let engine = Engine::new(pool, limits, registry_with(adapter.clone()), None);

    let dag = one_block_dag_json("retry-cap", json!({"retry": {"max_attempts": 10}}));
    let submission = engine
        .submit(start_request(dag, json!({"prompt": "x"})))
        .await
        .unwrap();
    wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    // executed attempts <= min(block.max_attempts, cap) + 1
    assert_eq!(adapter.request_count(), 2);
}

#[tokio::test]
async fn contract_repair_fixes_mismatched_output() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::new(
        "scripted",
        vec![
            Script::Ok("this is not json".into()),
            Script::Ok("{\"title\": \"fixed\"}".into()),
        ],
    );
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter.clone()),
        None,
    );

    let dag = one_block_dag_json(
        "contracted",
        json!({
            "output_schema": {
                "type": "object",
                "required": ["title"],
                "properties": {"title": {"type": "string"}}
            }
        }),
    );
    let submission = engine
        .submit(start_request(dag, json!({"prompt": "x"})))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Completed);
    assert_eq!(view.run["blocks"]["solo"]["outputs"]["result"]["title"], "fixed");

    let requests = adapter.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].title.contains("schema repair"));
}

#[tokio::test]
async fn contract_failure_without_repair_fails_block() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::always_ok("still not json");
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter),
        None,
    );

    let dag = one_block_dag_json(
        "contracted",
        json!({"output_schema": {"type": "object", "required": ["title"]}}),
    );
    let submission = engine
        .submit(start_request(dag, json!({"prompt": "x"})))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Failed);
    let block = &view.run["blocks"]["solo"];
    assert_eq!(block["error"]["stage"], "contract");
    assert_eq!(block["error"]["code"], "CONTRACT_FAILED");
    assert!(block["error"]["repair"].as_str().is_some());
}

#[tokio::test]
async fn shell_pre_gate_blocked_without_opt_in() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::always_ok("{}");
    // shell_gates_enabled defaults to false.
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter.clone()),
        None,
    );

    let dag = one_block_dag_json(
        "shell-gated",
        json!({"pre_gates": [{"type": "shell", "command": ["true"]}]}),
    );
    let submission = engine
        .submit(start_request(dag, json!({"prompt": "x"})))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Failed);
    let block = &view.run["blocks"]["solo"];
    assert_eq!(block["error"]["code"], "SHELL_GATES_DISABLED");
    assert_eq!(block["pre_gate_results"][0]["audit"]["status"], "blocked");
    assert_eq!(block["pre_gate_results"][0]["audit"]["gate_type"], "shell");
    assert_eq!(adapter.request_count(), 0, "gate blocked before dispatch");

    let fails = view
        .events
        .iter()
        .filter(|e| e.event_type == EventType::BlockFail)
        .count();
    assert_eq!(fails, 1);
}

#[tokio::test]
async fn run_budget_zero_fails_blocks_before_dispatch() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::always_ok("{}");
    let limits = SafetyLimits {
        max_tokens_per_run: Some(0),
        ..Default::default()
    };
    let engine = Engine::new(pool, limits, registry_with(adapter.clone()), None);

    let submission = engine
        .submit(start_request(
            linear_dag_json("budgeted"),
            json!({"prompt": "x"}),
        ))
        .await
        .unwrap();
    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;

    assert_eq!(view.status, arbor_db::models::RunStatus::Failed);
    assert_eq!(view.run["blocks"]["a"]["error"]["code"], "BUDGET_EXCEEDED");
    assert_eq!(adapter.request_count(), 0);
}

#[tokio::test]
async fn stop_run_cancels_in_flight_blocks() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::new(
        "scripted",
        vec![Script::Hang(Duration::from_secs(30))],
    );
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(adapter),
        None,
    );

    let submission = engine
        .submit(start_request(
            one_block_dag_json("hanging", json!({})),
            json!({"prompt": "x"}),
        ))
        .await
        .unwrap();

    // Give the block time to be dispatched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mode = engine.stop_run(&submission.run_id).await.unwrap();
    assert_eq!(mode, arbor_core::engine::StopMode::Active);

    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(5)).await;
    assert_eq!(view.status, arbor_db::models::RunStatus::Cancelled);

    // No events after the terminal run:fail.
    let last = view.events.last().unwrap();
    assert_eq!(last.event_type, EventType::RunFail);
    assert_eq!(last.data["code"], "CANCELLED");
}

#[tokio::test]
async fn stall_guard_cancels_after_grace_rearms() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::new(
        "scripted",
        vec![Script::Hang(Duration::from_secs(60))],
    );
    let limits = SafetyLimits {
        stall_timeout_ms: 50,
        ..Default::default()
    };
    let engine = Engine::new(pool, limits, registry_with(adapter), None);

    let submission = engine
        .submit(start_request(
            one_block_dag_json("stalled", json!({})),
            json!({"prompt": "x"}),
        ))
        .await
        .unwrap();

    let view = wait_terminal(&engine, &submission.run_id, Duration::from_secs(10)).await;
    assert_eq!(view.status, arbor_db::models::RunStatus::Cancelled);

    let last = view.events.last().unwrap();
    assert_eq!(last.event_type, EventType::RunFail);
    assert_eq!(last.data["reason"], "stall_timeout_exceeded");
    assert_eq!(last.data["code"], "STALL_TIMEOUT");
}

#[tokio::test]
async fn stop_all_reports_active_and_queued() {
    let (pool, _guard) = create_test_db().await;
    let adapter = ScriptedAdapter::new(
        "scripted",
        vec![Script::Hang(Duration::from_secs(30))],
    );
    let limits = SafetyLimits {
        max_concurrent_runs: 1,
        ..Default::default()
    };
    let engine = Engine::new(pool, limits, registry_with(adapter), None);

    let first = engine
        .submit(start_request(
            one_block_dag_json("one", json!({})),
            json!({"prompt": "x"}),
        ))
        .await
        .unwrap();
    let second = engine
        .submit(start_request(
            one_block_dag_json("two", json!({})),
            json!({"prompt": "x"}),
        ))
        .await
        .unwrap();
    assert!(second.queued);

    let (stopped, cancelled_queued) = engine.stop_all().await.unwrap();
    assert_eq!(stopped, 1);
    assert_eq!(cancelled_queued, 1);

    let view = wait_terminal(&engine, &first.run_id, Duration::from_secs(5)).await;
    assert_eq!(view.status, arbor_db::models::RunStatus::Cancelled);
    let queued_view = engine.run_state(&second.run_id).await.unwrap();
    assert_eq!(queued_view.status, arbor_db::models::RunStatus::Cancelled);
}

#[tokio::test]
async fn example_not_found_and_invalid_input() {
    let (pool, _guard) = create_test_db().await;
    let engine = Engine::new(
        pool,
        SafetyLimits::default(),
        registry_with(ScriptedAdapter::always_ok("{}")),
        None,
    );

    let err = engine
        .submit(StartRequest {
            example: Some("missing".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ExampleNotFound);

    let err = engine.submit(StartRequest::default()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);
}
