//! Simulated carrier: turns outbound messages into ACCEPTED and final status reports.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{EventPublisher, EventSubscriber};
use crate::events::{DeliveryStatus, OutboundMessage, StatusEvent};
use crate::shutdown::Shutdown;

const RECV_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub operator: String,
    pub worker: String,
    pub status_topic: String,
    pub accept_latency: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Percentage of messages reported FAILED; 0 never fails, 100 or more always does.
    pub fail_percent: u32,
}

/// Uniform in `[min, max)`, or `min` when the range is empty.
pub fn delivery_delay<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let spread = (max - min).as_millis() as u64;
    if spread == 0 {
        return min;
    }
    min + Duration::from_millis(rng.gen_range(0..spread))
}

pub fn should_fail<R: Rng + ?Sized>(rng: &mut R, fail_percent: u32) -> bool {
    match fail_percent {
        0 => false,
        p if p >= 100 => true,
        p => rng.gen_range(0..100) < p,
    }
}

pub struct DeliveryWorker {
    settings: WorkerSettings,
    subscriber: Box<dyn EventSubscriber>,
    publisher: Arc<dyn EventPublisher>,
    rng: StdRng,
}

impl DeliveryWorker {
    pub fn new(
        settings: WorkerSettings,
        subscriber: Box<dyn EventSubscriber>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::with_rng(settings, subscriber, publisher, StdRng::from_entropy())
    }

    pub fn with_rng(
        settings: WorkerSettings,
        subscriber: Box<dyn EventSubscriber>,
        publisher: Arc<dyn EventPublisher>,
        rng: StdRng,
    ) -> Self {
        Self {
            settings,
            subscriber,
            publisher,
            rng,
        }
    }

    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Handles one message at a time until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        tracing::info!(
            worker = %self.settings.worker,
            operator = %self.settings.operator,
            "delivery worker started"
        );
        loop {
            let delivery = tokio::select! {
                _ = shutdown.wait() => break,
                next = self.subscriber.recv() => next,
            };
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::warn!(worker = %self.settings.worker, error = %err, "worker receive failed");
                    if !sleep_or_shutdown(RECV_BACKOFF, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match OutboundMessage::from_record(&delivery.record) {
                Ok(message) => {
                    if !self.deliver(&message, &mut shutdown).await {
                        break;
                    }
                }
                Err(err) => tracing::warn!(
                    worker = %self.settings.worker,
                    offset = delivery.offset,
                    error = %err,
                    "skipping malformed outbound message"
                ),
            }

            if let Err(err) = self.subscriber.commit(&delivery).await {
                tracing::warn!(worker = %self.settings.worker, error = %err, "worker commit failed");
            }
        }
        tracing::info!(worker = %self.settings.worker, "delivery worker stopped");
    }

    /// Returns false when interrupted by shutdown; the record stays uncommitted.
    async fn deliver(&mut self, message: &OutboundMessage, shutdown: &mut Shutdown) -> bool {
        let trace_id = Uuid::new_v4().to_string();

        if !sleep_or_shutdown(self.settings.accept_latency, shutdown).await {
            return false;
        }
        self.report(message, DeliveryStatus::Accepted, &trace_id).await;

        let delay = delivery_delay(
            &mut self.rng,
            self.settings.min_delay,
            self.settings.max_delay,
        );
        if !sleep_or_shutdown(delay, shutdown).await {
            return false;
        }
        let status = if should_fail(&mut self.rng, self.settings.fail_percent) {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Delivered
        };
        self.report(message, status, &trace_id).await;
        true
    }

    async fn report(&self, message: &OutboundMessage, status: DeliveryStatus, trace_id: &str) {
        let event = StatusEvent {
            message_id: message.message_id,
            status,
            operator: self.settings.operator.clone(),
            at: Utc::now(),
            trace_id: trace_id.to_string(),
            worker: self.settings.worker.clone(),
        };
        let published = match event.to_record() {
            Ok(record) => self
                .publisher
                .publish(&self.settings.status_topic, record)
                .await
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match published {
            Ok(()) => tracing::debug!(
                message_id = %message.message_id,
                status = status.as_str(),
                %trace_id,
                worker = %self.settings.worker,
                "status reported"
            ),
            Err(error) => tracing::warn!(
                message_id = %message.message_id,
                status = status.as_str(),
                %error,
                "status publish failed"
            ),
        }
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &mut Shutdown) -> bool {
    if duration.is_zero() {
        return !shutdown.is_triggered();
    }
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
