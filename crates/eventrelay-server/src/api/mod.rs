// ABOUTME: API module containing the HTTP handlers of the eventrelay REST surface.
// ABOUTME: Organized into sub-modules for the event store and the queue, plus shared error responses.

pub mod events;
pub mod queue;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use eventrelay_store::{DeltaStoreError, QueueError};

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

pub(crate) fn unknown_environment(env: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("unknown environment: {}", env))
}

/// Map a delta store failure onto an HTTP status.
pub(crate) fn delta_store_failure(env: &str, err: DeltaStoreError) -> Response {
    match err {
        DeltaStoreError::Full => error_response(
            StatusCode::INSUFFICIENT_STORAGE,
            format!("event store of {} is full", env),
        ),
        DeltaStoreError::Closed => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("event store of {} is closed", env),
        ),
        other => {
            tracing::error!("event store of {} failed: {}", env, other);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "event store failure")
        }
    }
}

/// Map a queue failure onto an HTTP status.
pub(crate) fn queue_failure(env: &str, err: QueueError) -> Response {
    match err {
        QueueError::Full => error_response(
            StatusCode::INSUFFICIENT_STORAGE,
            format!("queue of {} is full", env),
        ),
        QueueError::Closed => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("queue of {} is closed", env),
        ),
        other => {
            tracing::error!("queue of {} failed: {}", env, other);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "queue failure")
        }
    }
}
