//! Approval suspension, decisions, and iteration lineage.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::Instant;

use arbor_core::adapter::AdapterRegistry;
use arbor_core::approval::{ApprovalDecision, Decision, RestartMode};
use arbor_core::engine::Engine;
use arbor_core::errors::ErrorCode;
use arbor_core::event::EventType;
use arbor_core::run::StartRequest;
use arbor_core::safety::SafetyLimits;
use arbor_db::models::RunStatus;
use arbor_test_utils::{ScriptedAdapter, create_test_db, one_block_dag_json};

fn approval_dag() -> Value {
    one_block_dag_json(
        "approved-solo",
        json!({"approval": {"required": true, "prompt": "Check the draft"}}),
    )
}

fn engine_with_defaults(pool: sqlx::SqlitePool) -> (Engine, std::sync::Arc<ScriptedAdapter>) {
    let adapter = ScriptedAdapter::always_ok("{\"ok\": true}");
    let mut registry = AdapterRegistry::new();
    registry.register(adapter.clone());
    (
        Engine::new(pool, SafetyLimits::default(), registry, None),
        adapter,
    )
}

fn start_request(dag: Value) -> StartRequest {
    StartRequest {
        dag: Some(dag),
        context: json!({"prompt": "draft it"}).as_object().cloned(),
        ..Default::default()
    }
}

async fn wait_status(engine: &Engine, run_id: &str, status: RunStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let view = engine.run_state(run_id).await.expect("run should exist");
        if view.status == status {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "run {run_id} never reached {status} (currently {:?})",
            view.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn decision(decision: Decision, iterate: bool, feedback: Option<&str>) -> ApprovalDecision {
    ApprovalDecision {
        decision,
        notes: None,
        feedback: feedback.map(str::to_owned),
        restart_mode: RestartMode::Refine,
        iterate,
    }
}

#[tokio::test]
async fn approve_resumes_and_completes() {
    let (pool, _guard) = create_test_db().await;
    let (engine, adapter) = engine_with_defaults(pool);

    let submission = engine.submit(start_request(approval_dag())).await.unwrap();
    wait_status(&engine, &submission.run_id, RunStatus::PausedApproval).await;

    // The approval is durably visible while paused.
    let view = engine.run_state(&submission.run_id).await.unwrap();
    let approval = view.approval.expect("pending approval should be mirrored");
    assert_eq!(approval["block_id"], "solo");
    assert_eq!(approval["prompt"], "Check the draft");
    assert_eq!(adapter.request_count(), 0, "block must not dispatch while paused");

    let applied = engine
        .decide_approval(
            &submission.run_id,
            Some("latest"),
            decision(Decision::Approve, true, None),
        )
        .await
        .unwrap();
    assert_eq!(applied.run_status, RunStatus::Running);
    assert!(applied.iterated_run_id.is_none());

    wait_status(&engine, &submission.run_id, RunStatus::Completed).await;
    let view = engine.run_state(&submission.run_id).await.unwrap();
    assert_eq!(view.run["context"]["__approval_solo"], true);
    assert_eq!(
        view.run["context"]["__override_input_solo_approved"],
        true
    );

    let types: Vec<EventType> = view.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::RunStart,
            EventType::ApprovalRequested,
            EventType::ApprovalDecided,
            EventType::BlockStart,
            EventType::BlockComplete,
            EventType::RunComplete,
        ]
    );
}

#[tokio::test]
async fn double_decision_is_rejected_without_mutation() {
    let (pool, _guard) = create_test_db().await;
    let (engine, _adapter) = engine_with_defaults(pool);

    let submission = engine.submit(start_request(approval_dag())).await.unwrap();
    wait_status(&engine, &submission.run_id, RunStatus::PausedApproval).await;

    engine
        .decide_approval(
            &submission.run_id,
            None,
            decision(Decision::Approve, true, None),
        )
        .await
        .unwrap();

    let err = engine
        .decide_approval(
            &submission.run_id,
            None,
            decision(Decision::Reject, true, None),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NoPendingApproval);

    wait_status(&engine, &submission.run_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    let (pool, _guard) = create_test_db().await;
    let (engine, _adapter) = engine_with_defaults(pool);

    let submission = engine.submit(start_request(approval_dag())).await.unwrap();
    wait_status(&engine, &submission.run_id, RunStatus::PausedApproval).await;

    let err = engine
        .decide_approval(
            &submission.run_id,
            Some("not-the-token"),
            decision(Decision::Approve, true, None),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidApprovalToken);

    // Still pending afterwards.
    let view = engine.run_state(&submission.run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::PausedApproval);
    assert!(view.approval.is_some());
}

#[tokio::test]
async fn decide_without_pending_approval() {
    let (pool, _guard) = create_test_db().await;
    let (engine, _adapter) = engine_with_defaults(pool);

    let err = engine
        .decide_approval("ghost", None, decision(Decision::Approve, true, None))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn reject_without_iteration_fails_the_run() {
    let (pool, _guard) = create_test_db().await;
    let (engine, adapter) = engine_with_defaults(pool);

    let submission = engine.submit(start_request(approval_dag())).await.unwrap();
    wait_status(&engine, &submission.run_id, RunStatus::PausedApproval).await;

    let applied = engine
        .decide_approval(
            &submission.run_id,
            None,
            decision(Decision::Reject, false, Some("not good")),
        )
        .await
        .unwrap();
    assert_eq!(applied.run_status, RunStatus::Failed);

    wait_status(&engine, &submission.run_id, RunStatus::Failed).await;
    let view = engine.run_state(&submission.run_id).await.unwrap();
    assert_eq!(view.run["blocks"]["solo"]["status"], "skipped");
    assert_eq!(adapter.request_count(), 0);

    let memory = &view.run["context"]["__shared_memory"];
    assert_eq!(memory["feedback_history"][0], "not good");
}

#[tokio::test]
async fn reject_with_iteration_spawns_child_run() {
    let (pool, _guard) = create_test_db().await;
    let (engine, _adapter) = engine_with_defaults(pool);

    let submission = engine.submit(start_request(approval_dag())).await.unwrap();
    let parent_id = submission.run_id.clone();
    wait_status(&engine, &parent_id, RunStatus::PausedApproval).await;

    let applied = engine
        .decide_approval(
            &parent_id,
            None,
            decision(Decision::Reject, true, Some("tighter")),
        )
        .await
        .unwrap();
    assert_eq!(applied.run_status, RunStatus::Iterated);
    let child_id = applied.iterated_run_id.expect("child run id");

    // Parent: iterated, linked, run:iterated emitted.
    wait_status(&engine, &parent_id, RunStatus::Iterated).await;
    let parent = engine.run_state(&parent_id).await.unwrap();
    assert_eq!(parent.run["context"]["__latest_iterated_run_id"], child_id);
    assert!(
        parent
            .events
            .iter()
            .any(|e| e.event_type == EventType::RunIterated)
    );

    // Child: paused again on the same approval block, lineage carried.
    wait_status(&engine, &child_id, RunStatus::PausedApproval).await;
    let child = engine.run_state(&child_id).await.unwrap();
    assert_eq!(child.run["context"]["__iteration_parent_run_id"], parent_id);
    assert_eq!(child.run["context"]["__iteration_root_run_id"], parent_id);
    assert_eq!(child.run["context"]["__shared_memory"]["cycle"], 1);
    let history = child.run["context"]["__shared_memory"]["feedback_history"]
        .as_array()
        .unwrap();
    assert_eq!(
        history,
        &vec![serde_json::json!("tighter")],
        "each rejection's feedback is recorded exactly once"
    );
    assert!(
        child
            .events
            .iter()
            .any(|e| e.event_type == EventType::RunStart),
        "child emits its own run:start"
    );

    // Approve the child so the test leaves nothing hanging.
    engine
        .decide_approval(&child_id, None, decision(Decision::Approve, true, None))
        .await
        .unwrap();
    wait_status(&engine, &child_id, RunStatus::Completed).await;
}

#[tokio::test]
async fn iteration_stops_at_max_cycles() {
    let (pool, _guard) = create_test_db().await;
    let (engine, _adapter) = engine_with_defaults(pool);

    // Seed shared memory at the cycle ceiling.
    let mut context = json!({"prompt": "draft"}).as_object().cloned().unwrap();
    context.insert(
        "__shared_memory".into(),
        json!({"cycle": 5, "max_cycles": 5, "feedback_history": [], "decisions": []}),
    );
    let req = StartRequest {
        dag: Some(approval_dag()),
        context: Some(context),
        ..Default::default()
    };

    let submission = engine.submit(req).await.unwrap();
    wait_status(&engine, &submission.run_id, RunStatus::PausedApproval).await;

    let applied = engine
        .decide_approval(
            &submission.run_id,
            None,
            decision(Decision::Reject, true, Some("again")),
        )
        .await
        .unwrap();
    assert_eq!(applied.run_status, RunStatus::Failed);
    assert!(applied.iterated_run_id.is_none());

    wait_status(&engine, &submission.run_id, RunStatus::Failed).await;
    let view = engine.run_state(&submission.run_id).await.unwrap();
    assert_eq!(view.run["context"]["iteration_stopped"], "max_cycles_reached");
    let last = view.events.last().unwrap();
    assert_eq!(last.event_type, EventType::RunFail);
    assert_eq!(last.data["code"], "MAX_CYCLES_REACHED");
}
