// ABOUTME: Background loop that drains an environment's task queue into a downstream status sink.
// ABOUTME: Each round commits the batch on success and aborts it on failure so it is retried later.

use std::sync::Arc;

use async_trait::async_trait;
use eventrelay_core::StatusUpdate;
use eventrelay_store::QueueError;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app_state::Environment;
use crate::config::ForwarderConfig;

/// Errors a sink reports for a whole batch.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("downstream unavailable: {0}")]
    Unavailable(String),

    #[error("downstream rejected batch: {0}")]
    Rejected(String),
}

/// Downstream consumer of status updates (a ticketing or monitoring system).
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver a batch. An error means nothing in the batch counts as delivered.
    async fn forward(&self, env: &str, batch: &[StatusUpdate]) -> Result<(), SinkError>;
}

/// Sink that only logs what it would have sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn forward(&self, env: &str, batch: &[StatusUpdate]) -> Result<(), SinkError> {
        for update in batch {
            tracing::info!(
                "[{}] event {} -> {}",
                env,
                update.event_id,
                update.status
            );
        }
        Ok(())
    }
}

/// What a single forwarding round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The queue had nothing to send.
    Idle,
    /// This many updates were delivered and removed from the queue.
    Delivered(usize),
    /// The sink failed; this many updates were put back.
    Requeued(usize),
}

/// Take one batch from the queue and hand it to `sink`.
pub async fn forward_once(
    env: &Environment,
    sink: &dyn StatusSink,
    max_items: usize,
) -> Result<RoundOutcome, QueueError> {
    let txn = match env.queue.get(false, None, max_items).await {
        Ok(txn) => txn,
        Err(QueueError::Empty) => {
            tracing::debug!("queue of {} is empty", env.name);
            return Ok(RoundOutcome::Idle);
        }
        Err(e) => return Err(e),
    };

    let batch = txn.items().to_vec();
    match sink.forward(&env.name, &batch).await {
        Ok(()) => {
            txn.commit()?;
            Ok(RoundOutcome::Delivered(batch.len()))
        }
        Err(e) => {
            tracing::warn!(
                "forwarding {} updates of {} failed, will retry: {}",
                batch.len(),
                env.name,
                e
            );
            txn.abort()?;
            Ok(RoundOutcome::Requeued(batch.len()))
        }
    }
}

/// Run `forward_once` every `config.interval()` until `shutdown` turns true
/// or its sender goes away.
pub fn spawn_forwarder(
    env: Environment,
    sink: Arc<dyn StatusSink>,
    config: ForwarderConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = tracing::info_span!("forwarder", env = %env.name);
    tokio::spawn(
        async move {
            tracing::info!(
                "forwarding every {}s, up to {} items",
                config.interval_secs,
                config.max_items
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.interval()) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                match forward_once(&env, sink.as_ref(), config.max_items).await {
                    Ok(RoundOutcome::Idle) => {}
                    Ok(outcome) => tracing::debug!("round finished: {:?}", outcome),
                    Err(e) => tracing::error!("forwarding round failed: {}", e),
                }
                if let Ok(stats) = env.queue.stats() {
                    tracing::trace!(
                        "queue entries: {}, hash entries: {}",
                        stats.queue_entries,
                        stats.hash_entries
                    );
                }
            }
            tracing::info!("forwarder stopped");
        }
        .instrument(span),
    )
}
