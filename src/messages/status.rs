use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::saga::{Compensator, SagaStep};
use super::store::{MessageStore, StatusOutcome};
use crate::bus::{Delivery, EventSubscriber};
use crate::events::StatusEvent;
use crate::shutdown::Shutdown;

const STORE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF: Duration = Duration::from_millis(200);
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(5);

/// Applies worker reports to message rows. A record is committed once its effect is
/// durable, so a crash in between replays the event and the terminal guard absorbs it.
///
/// A record whose update keeps failing is retried in place. Nothing behind it is read
/// until it is applied or shutdown is raised.
pub fn spawn_status_consumer(
    mut subscriber: Box<dyn EventSubscriber>,
    store: Arc<dyn MessageStore>,
    compensator: Compensator,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        'consume: loop {
            let delivery = tokio::select! {
                _ = shutdown.wait() => break,
                next = subscriber.recv() => next,
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::warn!(error = %err, "status subscriber error");
                    tokio::time::sleep(STORE_BACKOFF).await;
                    continue;
                }
            };
            let mut backoff = STORE_BACKOFF;
            while !handle_delivery(&delivery, store.as_ref(), &compensator).await {
                tracing::warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    retry_in_ms = backoff.as_millis() as u64,
                    "status event not applied, holding partition"
                );
                tokio::select! {
                    _ = shutdown.wait() => break 'consume,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_STORE_BACKOFF);
            }
            if let Err(err) = subscriber.commit(&delivery).await {
                tracing::warn!(error = %err, offset = delivery.offset, "status commit failed");
            }
        }
        tracing::debug!("status consumer stopped");
    })
}

/// Returns whether the record may be committed.
pub async fn handle_delivery(
    delivery: &Delivery,
    store: &dyn MessageStore,
    compensator: &Compensator,
) -> bool {
    let event = match StatusEvent::from_record(&delivery.record) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(
                topic = %delivery.topic,
                partition = delivery.partition,
                offset = delivery.offset,
                error = %err,
                "skipping malformed status event"
            );
            return true;
        }
    };

    let mut attempt = 0;
    let outcome = loop {
        attempt += 1;
        match store.apply_status(&event).await {
            Ok(outcome) => break outcome,
            Err(err) if attempt < STORE_ATTEMPTS => {
                tracing::warn!(message_id = %event.message_id, error = %err, attempt, "status update failed, retrying");
                tokio::time::sleep(STORE_BACKOFF * attempt).await;
            }
            Err(err) => {
                tracing::error!(message_id = %event.message_id, error = %err, "status update failed");
                return false;
            }
        }
    };

    match outcome {
        StatusOutcome::Missing => {
            tracing::warn!(message_id = %event.message_id, status = event.status.as_str(), "status for unknown message");
        }
        StatusOutcome::Ignored { current } => {
            tracing::debug!(
                message_id = %event.message_id,
                current = current.as_str(),
                incoming = event.status.as_str(),
                "message already terminal, status ignored"
            );
        }
        StatusOutcome::Applied {
            message,
            refund_owed,
        } => {
            tracing::info!(
                message_id = %message.id,
                status = message.status.as_str(),
                operator = message.operator.as_deref().unwrap_or_default(),
                trace_id = %event.trace_id,
                worker = %event.worker,
                step = %SagaStep::AwaitStatus,
                "message status updated"
            );
            if refund_owed {
                // Still OWED on failure; the sweeper retries.
                let _ = compensator.settle(&message).await;
            }
        }
    }
    true
}
