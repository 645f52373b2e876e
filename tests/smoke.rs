// ABOUTME: End-to-end smoke test for the full eventrelay lifecycle.
// ABOUTME: Tests config loading, event ingest and merge, queue coalescing, forwarding, and stale sweeps.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use eventrelay_core::StatusUpdate;
use eventrelay_server::{
    AppState, EnvironmentsFile, RoundOutcome, SinkError, StatusSink, create_router, forward_once,
    sweep_once,
};
use eventrelay_store::StorageManager;
use http::Request;
use tokio::sync::Mutex;
use tower::ServiceExt;

/// Helper to extract JSON body from a response.
async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
}

/// Sink that keeps every delivered update.
#[derive(Default)]
struct CollectingSink {
    delivered: Mutex<Vec<StatusUpdate>>,
}

#[async_trait]
impl StatusSink for CollectingSink {
    async fn forward(&self, _env: &str, batch: &[StatusUpdate]) -> Result<(), SinkError> {
        self.delivered.lock().await.extend_from_slice(batch);
        Ok(())
    }
}

#[tokio::test]
async fn smoke_test_full_lifecycle() {
    // 1. Environments file with a merge schema next to it
    let dir = tempfile::TempDir::new().unwrap();
    let home = dir.path().join("home");
    std::fs::write(
        dir.path().join("event-schema.json"),
        serde_json::to_vec(&serde_json::json!({
            "properties": {
                "mand": {"mergeStrategy": "objectMerge"},
                "free": {
                    "properties": {
                        "eventNormalizedStatus": {"mergeStrategy": "append"}
                    }
                }
            }
        }))
        .unwrap(),
    )
    .unwrap();
    let env_file = dir.path().join("environments.yaml");
    std::fs::write(
        &env_file,
        "environments:\n  prod:\n    event_schema: event-schema.json\n    queue:\n      name: status\n",
    )
    .unwrap();

    // 2. Open every environment
    let manager = StorageManager::new(home.clone()).unwrap();
    let environments = EnvironmentsFile::load(&env_file).unwrap();
    let state = Arc::new(AppState::open(&manager, &environments).unwrap());
    assert!(home.join("deltas/prod.db").exists());
    assert!(home.join("queues/prod/status.db").exists());

    // 3. Health check
    let resp = create_router(Arc::clone(&state))
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // 4. POST three fragments of E1 and one of E2
    let fragments = [
        serde_json::json!({
            "mand": {"eventId": "E1", "eventName": "LinkDown"},
            "free": {"eventNormalizedStatus": [{"value": "New"}]}
        }),
        serde_json::json!({
            "mand": {"eventId": "E2", "eventName": "DiskFull"},
            "free": {"eventNormalizedStatus": [{"value": "New"}]}
        }),
        serde_json::json!({
            "mand": {"eventId": "E1", "severity": "major"},
            "free": {"eventNormalizedStatus": [{"value": "Acknowledged"}]}
        }),
        serde_json::json!({
            "mand": {"eventId": "E1"},
            "free": {"eventNormalizedStatus": [{"value": "Resolved"}]}
        }),
    ];
    for fragment in &fragments {
        let resp = create_router(Arc::clone(&state))
            .oneshot(
                Request::post("/events/prod")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(fragment).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 202, "ingest should return 202");
        assert_eq!(json_body(resp).await["queued"], true);
    }

    // 5. GET the merged E1
    let resp = create_router(Arc::clone(&state))
        .oneshot(Request::get("/events/prod?id=E1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let merged = json_body(resp).await;
    assert_eq!(merged["mand"]["eventName"], "LinkDown");
    assert_eq!(merged["mand"]["severity"], "major");
    let statuses: Vec<&str> = merged["free"]["eventNormalizedStatus"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["value"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["New", "Acknowledged", "Resolved"]);

    // 6. The queue coalesced E1 in place: E1 first, with its latest status
    let resp = create_router(Arc::clone(&state))
        .oneshot(Request::get("/queue/prod").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let queued = json_body(resp).await;
    let queued = queued.as_array().unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0]["eventId"], "E1");
    assert_eq!(queued[0]["status"], "Resolved");
    assert_eq!(queued[1]["eventId"], "E2");

    // 7. Forward everything downstream
    let env = state.environment("prod").unwrap();
    let sink = CollectingSink::default();
    assert_eq!(
        forward_once(env, &sink, 100).await.unwrap(),
        RoundOutcome::Delivered(2)
    );
    assert_eq!(forward_once(env, &sink, 100).await.unwrap(), RoundOutcome::Idle);
    let stats = env.queue.stats().unwrap();
    assert_eq!((stats.queue_entries, stats.hash_entries), (0, 0));
    assert_eq!(sink.delivered.lock().await.len(), 2);

    // 8. A sweep with max age 0 retires both events as No_issue_created
    assert_eq!(sweep_once(env, 0).await.unwrap(), 2);
    let resp = create_router(Arc::clone(&state))
        .oneshot(Request::get("/events/prod").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(resp).await, serde_json::json!([]));
    assert_eq!(forward_once(env, &sink, 100).await.unwrap(), RoundOutcome::Delivered(2));
    let delivered = sink.delivered.lock().await;
    assert!(
        delivered[2..]
            .iter()
            .all(|update| update.status == eventrelay_core::NO_ISSUE_CREATED)
    );
    drop(delivered);

    // 9. DELETE /events with a max age keeps fresh events
    let resp = create_router(Arc::clone(&state))
        .oneshot(
            Request::post("/events/prod")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&serde_json::json!({"mand": {"eventId": "E3"}})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let resp = create_router(Arc::clone(&state))
        .oneshot(
            Request::delete("/events/prod?max_age=3600")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(json_body(resp).await["deleted"], 0);

    // 10. Close and reopen: the surviving event is still there
    state.close().await;
    drop(state);
    let reopened = AppState::open(&manager, &environments).unwrap();
    let env = reopened.environment("prod").unwrap();
    assert_eq!(env.events.entity_ids().unwrap(), vec!["E3".to_string()]);
    assert_eq!(env.queue.qsize().unwrap(), 0);
    reopened.close().await;
}
