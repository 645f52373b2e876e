// ABOUTME: Queue API handlers: inspect, count, and purge an environment's pending status updates.
// ABOUTME: Single items are addressed by the hex content hash of their event id.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use eventrelay_core::{ContentHash, StatusUpdate};
use serde::{Deserialize, Serialize};

use crate::api::{error_response, queue_failure, unknown_environment};
use crate::app_state::SharedState;

/// Query parameters for reading a queue.
#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    #[serde(default)]
    pub info: bool,
    #[serde(default)]
    pub count: bool,
    pub limit: Option<usize>,
}

/// One pending update as listed by `GET /queue/{env}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub event_id: String,
    pub event_name: Option<String>,
    pub status: String,
    pub links: Links,
}

#[derive(Debug, Serialize)]
pub struct Links {
    #[serde(rename = "self")]
    pub self_link: String,
}

impl QueueSummary {
    fn new(env: &str, hash: &ContentHash, update: StatusUpdate) -> Self {
        Self {
            event_id: update.event_id,
            event_name: update.event_name,
            status: update.status,
            links: Links {
                self_link: format!("/queue/{}/{}", env, hash),
            },
        }
    }
}

/// GET /queue/{env} - Pending updates in queue order (`?limit=` caps the
/// list), the entry count with `?count=true`, or a queue description with
/// `?info=true`.
pub async fn get_queue(
    State(state): State<SharedState>,
    Path(env): Path<String>,
    Query(query): Query<QueueQuery>,
) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };
    let queue = &environment.queue;

    if query.info {
        return match queue.info() {
            Ok(info) => Json(info).into_response(),
            Err(e) => queue_failure(&env, e),
        };
    }
    if query.count {
        return match queue.qsize() {
            Ok(count) => Json(count).into_response(),
            Err(e) => queue_failure(&env, e),
        };
    }

    match queue.peek_entries(query.limit.unwrap_or(usize::MAX)) {
        Ok(entries) => {
            let summaries: Vec<QueueSummary> = entries
                .into_iter()
                .map(|(hash, update)| QueueSummary::new(&env, &hash, update))
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => queue_failure(&env, e),
    }
}

/// DELETE /queue/{env} - Discard every pending update.
pub async fn purge_queue(State(state): State<SharedState>, Path(env): Path<String>) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };
    match environment.queue.purge().await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => queue_failure(&env, e),
    }
}

/// GET /queue/{env}/{id} - One pending update by content hash.
pub async fn get_queue_item(
    State(state): State<SharedState>,
    Path((env, id)): Path<(String, String)>,
) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };
    let Ok(hash) = id.parse::<ContentHash>() else {
        return item_not_found(&id);
    };
    match environment.queue.peek_by_hash(&hash) {
        Ok(Some(update)) => Json(update).into_response(),
        Ok(None) => item_not_found(&id),
        Err(e) => queue_failure(&env, e),
    }
}

/// DELETE /queue/{env}/{id} - Remove one pending update by content hash.
pub async fn delete_queue_item(
    State(state): State<SharedState>,
    Path((env, id)): Path<(String, String)>,
) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };
    let Ok(hash) = id.parse::<ContentHash>() else {
        return item_not_found(&id);
    };
    match environment.queue.unqueue_by_hash(&hash).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => item_not_found(&id),
        Err(e) => queue_failure(&env, e),
    }
}

fn item_not_found(id: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("no queued item {}", id))
}

#[cfg(test)]
mod tests {
    use crate::app_state::SharedState;
    use crate::app_state::test_support::state_with;
    use crate::config::EnvironmentConfig;
    use crate::routes::create_router;
    use axum::body::Body;
    use eventrelay_core::{Hashed, StatusUpdate};
    use http::Request;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn send(state: &SharedState, req: Request<Body>) -> (u16, Value) {
        let resp = create_router(Arc::clone(state)).oneshot(req).await.unwrap();
        let status = resp.status().as_u16();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::delete(uri).body(Body::empty()).unwrap()
    }

    async fn seeded() -> (tempfile::TempDir, SharedState) {
        let (dir, state) = state_with("prod", EnvironmentConfig::default());
        let queue = &state.environment("prod").unwrap().queue;
        let mut first = StatusUpdate::new("E1", "New");
        first.event_name = Some("LinkDown".to_string());
        queue.put(&first).await.unwrap();
        queue.put(&StatusUpdate::new("E2", "Acknowledged")).await.unwrap();
        (dir, state)
    }

    #[tokio::test]
    async fn list_summarizes_pending_updates() {
        let (_dir, state) = seeded().await;
        let (status, body) = send(&state, get("/queue/prod")).await;
        assert_eq!(status, 200);

        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["eventId"], "E1");
        assert_eq!(items[0]["eventName"], "LinkDown");
        assert_eq!(items[0]["status"], "New");
        let hash = StatusUpdate::new("E1", "").content_hash();
        assert_eq!(items[0]["links"]["self"], format!("/queue/prod/{}", hash));

        let (_, body) = send(&state, get("/queue/prod?limit=1")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn count_and_info() {
        let (_dir, state) = seeded().await;

        let (status, body) = send(&state, get("/queue/prod?count=true")).await;
        assert_eq!(status, 200);
        assert_eq!(body, 2);

        let (status, body) = send(&state, get("/queue/prod?info=true")).await;
        assert_eq!(status, 200);
        assert_eq!(body["queueName"], "queue");
        assert_eq!(body["entries"], 2);
        assert_eq!(body["compression"], false);
        assert_eq!(body["maxDiskSize"], 100 * 1024 * 1024);
        assert!(body["queuePath"].as_str().unwrap().ends_with("queue.db"));
    }

    #[tokio::test]
    async fn item_lookup_and_removal() {
        let (_dir, state) = seeded().await;
        let hash = StatusUpdate::new("E2", "").content_hash();
        let uri = format!("/queue/prod/{}", hash);

        let (status, body) = send(&state, get(&uri)).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "Acknowledged");

        let (status, _) = send(&state, delete(&uri)).await;
        assert_eq!(status, 204);
        let (status, _) = send(&state, get(&uri)).await;
        assert_eq!(status, 404);
        let (status, _) = send(&state, delete(&uri)).await;
        assert_eq!(status, 404);

        let (status, _) = send(&state, get("/queue/prod/not-a-hash")).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn purge_empties_queue() {
        let (_dir, state) = seeded().await;
        let (status, body) = send(&state, delete("/queue/prod")).await;
        assert_eq!(status, 200);
        assert_eq!(body["deleted"], 2);

        let (_, body) = send(&state, get("/queue/prod")).await;
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_environment_is_404() {
        let (_dir, state) = seeded().await;
        let (status, _) = send(&state, get("/queue/qa")).await;
        assert_eq!(status, 404);
        let (status, _) = send(&state, delete("/queue/qa")).await;
        assert_eq!(status, 404);
    }
}
