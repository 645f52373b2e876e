// ABOUTME: Event store API handlers: ingest event fragments, read merged events, retire old ones.
// ABOUTME: Ingested events that carry a normalized status also enqueue a status update.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use eventrelay_core::StatusUpdate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{delta_store_failure, error_response, queue_failure, unknown_environment};
use crate::app_state::SharedState;

/// Query parameters for reading events.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub id: Option<String>,
}

/// GET /events/{env}?id=<id> - The merged event, or every merged event
/// when no id is given.
pub async fn get_events(
    State(state): State<SharedState>,
    Path(env): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };

    let result = match query.id {
        Some(id) => environment.events.get_merged(&id).map(Json),
        None => environment
            .events
            .get_all()
            .map(|docs| Json(Value::Array(docs))),
    };
    match result {
        Ok(body) => body.into_response(),
        Err(e) => delta_store_failure(&env, e),
    }
}

/// POST /events/{env} - Record an event fragment under its `mand.eventId`.
///
/// The status update is queued before the fragment is stored, so a 507 from
/// a full queue leaves the event store untouched and the request can be
/// retried as is. Re-queuing on retry coalesces with the pending update.
pub async fn post_event(
    State(state): State<SharedState>,
    Path(env): Path<String>,
    Json(doc): Json<Value>,
) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };
    let Some(event_id) = doc
        .pointer("/mand/eventId")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return error_response(StatusCode::BAD_REQUEST, "event has no mand.eventId");
    };

    let queued = match StatusUpdate::from_event(&doc) {
        Some(update) => match environment.queue.put(&update).await {
            Ok(_) => true,
            Err(e) => return queue_failure(&env, e),
        },
        None => false,
    };

    if let Err(e) = environment.events.append(&event_id, &doc).await {
        return delta_store_failure(&env, e);
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "eventId": event_id, "queued": queued })),
    )
        .into_response()
}

/// DELETE /events/{env}?max_age=<seconds> - Delete every event untouched for
/// at least `max_age` seconds.
pub async fn delete_events(
    State(state): State<SharedState>,
    Path(env): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(environment) = state.environment(&env) else {
        return unknown_environment(&env);
    };
    let Some(raw) = params.get("max_age") else {
        return error_response(StatusCode::BAD_REQUEST, "max_age is required");
    };
    let Ok(max_age) = raw.parse::<u64>() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("max_age must be a number of seconds, got {:?}", raw),
        );
    };

    match environment.events.cleanup(max_age).await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(e) => delta_store_failure(&env, e),
    }
}
