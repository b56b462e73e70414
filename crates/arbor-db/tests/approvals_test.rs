use chrono::Utc;

use arbor_db::models::ApprovalStatus;
use arbor_db::queries::approvals::{self, NewApproval};
use arbor_test_utils::create_test_db;

fn approval<'a>(token: &'a str, run_id: &'a str) -> NewApproval<'a> {
    NewApproval {
        token,
        run_id,
        block_id: "draft",
        prompt: "review this",
        requested_at: Utc::now(),
        payload_json: "{}",
    }
}

#[tokio::test]
async fn upsert_and_fetch() {
    let (pool, _guard) = create_test_db().await;

    approvals::upsert_approval(&pool, &approval("t1", "r1"))
        .await
        .unwrap();

    let row = approvals::get_approval(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(row.status, ApprovalStatus::Pending);
    assert_eq!(row.run_id, "r1");
    assert!(approvals::get_approval(&pool, "t2").await.unwrap().is_none());
}

#[tokio::test]
async fn latest_pending_picks_newest() {
    let (pool, _guard) = create_test_db().await;

    let mut older = approval("t1", "r1");
    let earlier = Utc::now() - chrono::Duration::minutes(2);
    older.requested_at = earlier;
    approvals::upsert_approval(&pool, &older).await.unwrap();
    approvals::upsert_approval(&pool, &approval("t2", "r1"))
        .await
        .unwrap();

    let latest = approvals::latest_pending_approval(&pool, "r1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.token, "t2");

    let any = approvals::latest_pending_any(&pool).await.unwrap().unwrap();
    assert_eq!(any.token, "t2");
}

#[tokio::test]
async fn decide_is_a_single_shot_cas() {
    let (pool, _guard) = create_test_db().await;

    approvals::upsert_approval(&pool, &approval("t1", "r1"))
        .await
        .unwrap();

    let first = approvals::decide_approval(
        &pool,
        "t1",
        ApprovalStatus::Approved,
        Some("operator"),
        Some("lgtm"),
    )
    .await
    .unwrap();
    assert_eq!(first, 1);

    // A second decision affects zero rows and mutates nothing.
    let second =
        approvals::decide_approval(&pool, "t1", ApprovalStatus::Rejected, None, None)
            .await
            .unwrap();
    assert_eq!(second, 0);

    let row = approvals::get_approval(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(row.status, ApprovalStatus::Approved);
    assert_eq!(row.notes.as_deref(), Some("lgtm"));
    assert!(row.decided_at.is_some());

    // No longer pending.
    assert!(
        approvals::latest_pending_approval(&pool, "r1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn decided_rows_are_not_resurrected_by_upsert() {
    let (pool, _guard) = create_test_db().await;

    approvals::upsert_approval(&pool, &approval("t1", "r1"))
        .await
        .unwrap();
    approvals::decide_approval(&pool, "t1", ApprovalStatus::Rejected, None, None)
        .await
        .unwrap();

    approvals::upsert_approval(&pool, &approval("t1", "r1"))
        .await
        .unwrap();
    let row = approvals::get_approval(&pool, "t1").await.unwrap().unwrap();
    assert_eq!(row.status, ApprovalStatus::Rejected);
}

#[tokio::test]
async fn list_approvals_for_run() {
    let (pool, _guard) = create_test_db().await;

    approvals::upsert_approval(&pool, &approval("t1", "r1"))
        .await
        .unwrap();
    approvals::upsert_approval(&pool, &approval("t2", "r1"))
        .await
        .unwrap();
    approvals::upsert_approval(&pool, &approval("t3", "r2"))
        .await
        .unwrap();

    let rows = approvals::list_approvals_for_run(&pool, "r1").await.unwrap();
    assert_eq!(rows.len(), 2);
}
