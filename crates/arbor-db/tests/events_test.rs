use chrono::Utc;

use arbor_db::queries::events::{self, NewEvent};
use arbor_test_utils::create_test_db;

fn event<'a>(run_id: &'a str, event_type: &'a str) -> NewEvent<'a> {
    NewEvent {
        run_id,
        event_type,
        block_id: None,
        data_json: "{}",
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn sequences_are_strictly_increasing() {
    let (pool, _guard) = create_test_db().await;

    let mut last = 0;
    for _ in 0..10 {
        let seq = events::append_event(&pool, &event("r1", "block:start"))
            .await
            .unwrap();
        assert!(seq > last, "sequence must be strictly increasing");
        last = seq;
    }
}

#[tokio::test]
async fn sequences_are_monotonic_across_runs() {
    let (pool, _guard) = create_test_db().await;

    let a = events::append_event(&pool, &event("r1", "run:start"))
        .await
        .unwrap();
    let b = events::append_event(&pool, &event("r2", "run:start"))
        .await
        .unwrap();
    let c = events::append_event(&pool, &event("r1", "run:complete"))
        .await
        .unwrap();
    assert!(a < b && b < c, "sequence is per-store, not per-run");
}

#[tokio::test]
async fn events_since_is_exclusive_and_ordered() {
    let (pool, _guard) = create_test_db().await;

    let mut seqs = Vec::new();
    for event_type in ["run:start", "block:start", "block:complete", "run:complete"] {
        seqs.push(
            events::append_event(&pool, &event("r1", event_type))
                .await
                .unwrap(),
        );
    }
    // Interleave an event from another run.
    events::append_event(&pool, &event("other", "run:start"))
        .await
        .unwrap();

    let all = events::events_since(&pool, "r1", 0).await.unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));

    let tail = events::events_since(&pool, "r1", seqs[1]).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].event_type, "block:complete");
}

#[tokio::test]
async fn latest_seq_and_count() {
    let (pool, _guard) = create_test_db().await;

    assert_eq!(events::latest_seq(&pool, "r1").await.unwrap(), 0);

    let s1 = events::append_event(&pool, &event("r1", "run:start"))
        .await
        .unwrap();
    let s2 = events::append_event(&pool, &event("r1", "run:complete"))
        .await
        .unwrap();

    assert_eq!(events::latest_seq(&pool, "r1").await.unwrap(), s2.max(s1));
    assert_eq!(events::count_events(&pool, "r1").await.unwrap(), 2);
}

#[tokio::test]
async fn block_id_and_payload_roundtrip() {
    let (pool, _guard) = create_test_db().await;

    let new_event = NewEvent {
        run_id: "r1",
        event_type: "block:fail",
        block_id: Some("draft"),
        data_json: "{\"reason\": \"nope\"}",
        timestamp: Utc::now(),
    };
    events::append_event(&pool, &new_event).await.unwrap();

    let rows = events::events_since(&pool, "r1", 0).await.unwrap();
    assert_eq!(rows[0].block_id.as_deref(), Some("draft"));
    assert_eq!(rows[0].data_json, "{\"reason\": \"nope\"}");
}
