// ABOUTME: Background loop that retires events which went stale without anyone opening a ticket.
// ABOUTME: Queues a No_issue_created status for each stale event, then deletes its delta history.

use chrono::Utc;
use eventrelay_core::{Hashed, NO_ISSUE_CREATED, StatusUpdate};
use eventrelay_store::{DeltaStoreError, QueueError};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app_state::Environment;
use crate::config::StaleWatchConfig;

/// Errors that can end a sweep early.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("delta store error: {0}")]
    DeltaStore(#[from] DeltaStoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Retire every entity untouched for `max_age_secs`. Returns how many were
/// retired. A full queue ends the sweep early; the remaining entities are
/// kept for the next one.
pub async fn sweep_once(env: &Environment, max_age_secs: u64) -> Result<usize, SweepError> {
    let stale = env.events.untouched(max_age_secs)?;
    let mut retired = 0;

    for (event_id, doc) in stale {
        match retire(env, &event_id, doc, max_age_secs).await {
            Ok(true) => retired += 1,
            Ok(false) => {}
            Err(SweepError::Queue(QueueError::Full)) => {
                tracing::warn!(
                    "queue of {} is full, keeping {} and the remaining stale events for the next sweep",
                    env.name,
                    event_id
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if retired > 0 {
        tracing::info!("retired {} stale events of {}", retired, env.name);
    }
    Ok(retired)
}

/// Queue the No_issue_created update for one stale event and delete it,
/// unless a new fragment arrived since the scan. A refreshed event is kept
/// and its current status is queued again over the No_issue_created one.
async fn retire(
    env: &Environment,
    event_id: &str,
    doc: Value,
    max_age_secs: u64,
) -> Result<bool, SweepError> {
    env.queue.put(&no_issue_update(event_id, doc)).await?;
    if env.events.delete_if_untouched(event_id, max_age_secs).await? {
        return Ok(true);
    }

    tracing::info!("{} of {} was updated during the sweep, keeping it", event_id, env.name);
    let current = env.events.get_merged(event_id)?;
    match StatusUpdate::from_event(&current) {
        Some(update) => {
            env.queue.put(&update).await?;
        }
        None => {
            env.queue.unqueue_by_hash(&StatusUpdate::new(event_id, "").content_hash()).await?;
        }
    }
    Ok(false)
}

fn no_issue_update(event_id: &str, mut doc: Value) -> StatusUpdate {
    let mut update = StatusUpdate::new(event_id, NO_ISSUE_CREATED);
    update.event_name = doc
        .pointer("/mand/eventName")
        .and_then(Value::as_str)
        .map(str::to_string);

    if !doc.is_object() {
        doc = Value::Object(Map::new());
    }
    if let Some(fields) = doc.as_object_mut() {
        let free = fields
            .entry("free")
            .or_insert_with(|| Value::Object(Map::new()));
        if !free.is_object() {
            *free = Value::Object(Map::new());
        }
        if let Some(free) = free.as_object_mut() {
            free.insert(
                "eventNormalizedStatus".to_string(),
                json!([{
                    "value": NO_ISSUE_CREATED,
                    "timestamp": Utc::now().timestamp_millis().to_string(),
                }]),
            );
        }
    }
    update.event = doc;
    update
}

/// Run `sweep_once` every `config.interval()` until `shutdown` turns true or
/// its sender goes away.
pub fn spawn_stale_watcher(
    env: Environment,
    config: StaleWatchConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = tracing::info_span!("stale_watcher", env = %env.name);
    tokio::spawn(
        async move {
            tracing::info!(
                "sweeping every {}s for events older than {}s",
                config.interval_secs,
                config.max_age_secs
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.interval()) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                if let Err(e) = sweep_once(&env, config.max_age_secs).await {
                    tracing::error!("stale sweep failed: {}", e);
                }
            }
            tracing::info!("stale watcher stopped");
        }
        .instrument(span),
    )
}
