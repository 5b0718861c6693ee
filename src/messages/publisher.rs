use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, Permit, Receiver, Sender};
use tokio::task::JoinHandle;

use super::models::{Message, MessageKind};
use super::saga::{Compensator, SagaStep};
use super::store::MessageStore;
use crate::bus::{BusError, EventPublisher};
use crate::events::OutboundMessage;
use crate::shutdown::Shutdown;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("publish queue is full")]
    Full,
    #[error("publish pipeline stopped")]
    Closed,
}

/// Producer side of the bounded handoff between request handlers and the drainer.
#[derive(Clone)]
pub struct PublishQueue {
    tx: Sender<Message>,
    enqueue_timeout: Duration,
}

pub fn publish_queue(capacity: usize, enqueue_timeout: Duration) -> (PublishQueue, Receiver<Message>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PublishQueue { tx, enqueue_timeout }, rx)
}

impl PublishQueue {
    /// Waits up to the enqueue timeout for a free slot. Holding the permit guarantees the
    /// later hand-off cannot block or fail.
    pub async fn reserve(&self) -> Result<Permit<'_, Message>, QueueError> {
        match tokio::time::timeout(self.enqueue_timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Full),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishTopics {
    pub normal: String,
    pub priority: String,
}

impl PublishTopics {
    pub fn for_kind(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Normal => &self.normal,
            MessageKind::Priority => &self.priority,
        }
    }
}

/// Drains the handoff queue one message at a time. After shutdown the channel is closed
/// and whatever is already buffered is still published.
pub fn spawn_publisher(
    mut rx: Receiver<Message>,
    publisher: Arc<dyn EventPublisher>,
    topics: PublishTopics,
    store: Arc<dyn MessageStore>,
    compensator: Compensator,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                next = rx.recv() => match next {
                    Some(message) => {
                        publish_one(&message, publisher.as_ref(), &topics, store.as_ref(), &compensator).await;
                    }
                    None => break,
                },
            }
        }
        rx.close();
        while let Some(message) = rx.recv().await {
            publish_one(&message, publisher.as_ref(), &topics, store.as_ref(), &compensator).await;
        }
        tracing::debug!("publish drainer stopped");
    })
}

async fn publish_one(
    message: &Message,
    publisher: &dyn EventPublisher,
    topics: &PublishTopics,
    store: &dyn MessageStore,
    compensator: &Compensator,
) {
    let topic = topics.for_kind(message.kind);
    let published = match OutboundMessage::from(message).to_record() {
        Ok(record) => publisher.publish(topic, record).await,
        Err(err) => Err(BusError::Transport(err.to_string())),
    };

    match published {
        Ok(()) => match store.mark_queued(message.id).await {
            Ok(true) => tracing::debug!(message_id = %message.id, %topic, "message queued"),
            Ok(false) => tracing::debug!(
                message_id = %message.id,
                "message already advanced past CREATED"
            ),
            Err(err) => tracing::error!(
                message_id = %message.id,
                error = %err,
                "failed to mark message queued"
            ),
        },
        Err(err) => {
            tracing::warn!(
                message_id = %message.id,
                client_id = %message.client_id,
                %topic,
                error = %err,
                step = %SagaStep::Publish,
                "publish failed, compensating"
            );
            if let Err(err) = compensator.publish_failed(message).await {
                tracing::error!(message_id = %message.id, ?err, "publish compensation failed");
            }
        }
    }
}
