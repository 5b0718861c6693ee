//! Compensating half of the submission saga.
//!
//! Money leaves the client's balance before a message is recorded or published. Every
//! path that ends without a delivery owes that money back, and the refund is issued here
//! with a reference derived from the message id so a retry is absorbed by the ledger.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use super::models::Message;
use super::store::{MessageStore, StatusOutcome};
use crate::ledger::{LedgerClient, LedgerClientError};
use crate::shutdown::Shutdown;

pub const SWEEP_BATCH: i64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SagaStep {
    Debit,
    Persist,
    Publish,
    AwaitStatus,
    Compensate,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Debit => "debit",
            SagaStep::Persist => "persist",
            SagaStep::Publish => "publish",
            SagaStep::AwaitStatus => "await_status",
            SagaStep::Compensate => "compensate",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn debit_reference(message_id: Uuid) -> String {
    format!("message:{message_id}:debit")
}

pub fn refund_reference(message_id: Uuid) -> String {
    format!("message:{message_id}:refund")
}

#[derive(Clone)]
pub struct Compensator {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn MessageStore>,
}

impl Compensator {
    pub fn new(ledger: Arc<dyn LedgerClient>, store: Arc<dyn MessageStore>) -> Self {
        Self { ledger, store }
    }

    /// Returns a debit whose message row never made it to the store.
    pub async fn refund_unrecorded(
        &self,
        client_id: &str,
        message_id: Uuid,
        amount_minor: i64,
    ) -> Result<i64, LedgerClientError> {
        let result = self
            .ledger
            .refund(client_id, amount_minor, &refund_reference(message_id))
            .await;
        match &result {
            Ok(balance) => tracing::info!(
                %client_id,
                %message_id,
                amount_minor,
                balance_after = balance,
                step = %SagaStep::Compensate,
                "refunded unrecorded message"
            ),
            Err(err) => tracing::error!(
                %client_id,
                %message_id,
                amount_minor,
                error = %err,
                step = %SagaStep::Compensate,
                "refund for unrecorded message failed"
            ),
        }
        result
    }

    /// Issues the refund owed by `message` and clears its outbox marker. On failure the
    /// marker stays OWED for the sweeper.
    pub async fn settle(&self, message: &Message) -> anyhow::Result<()> {
        let balance = self
            .ledger
            .refund(
                &message.client_id,
                message.price_minor,
                &refund_reference(message.id),
            )
            .await
            .map_err(|err| {
                tracing::error!(
                    message_id = %message.id,
                    client_id = %message.client_id,
                    amount_minor = message.price_minor,
                    error = %err,
                    step = %SagaStep::Compensate,
                    "refund failed, left owed"
                );
                err
            })?;
        self.store.settle_refund(message.id).await?;
        tracing::info!(
            message_id = %message.id,
            client_id = %message.client_id,
            amount_minor = message.price_minor,
            balance_after = balance,
            status = message.status.as_str(),
            step = %SagaStep::Compensate,
            "refund settled"
        );
        Ok(())
    }

    /// Moves a message that could not be published to FAILED_TO_QUEUE and refunds it.
    pub async fn publish_failed(&self, message: &Message) -> anyhow::Result<()> {
        match self.store.mark_failed_to_queue(message.id).await? {
            StatusOutcome::Applied {
                message,
                refund_owed: true,
            } => self.settle(&message).await,
            StatusOutcome::Applied { .. } => Ok(()),
            StatusOutcome::Ignored { current } => {
                tracing::debug!(
                    message_id = %message.id,
                    status = current.as_str(),
                    "message already advanced, publish failure ignored"
                );
                Ok(())
            }
            StatusOutcome::Missing => {
                tracing::warn!(message_id = %message.id, "publish failed for unknown message");
                Ok(())
            }
        }
    }

    /// Retries every refund still owed. Returns how many were settled.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let owed = self.store.refunds_owed(SWEEP_BATCH).await?;
        let mut settled = 0;
        for message in &owed {
            if self.settle(message).await.is_ok() {
                settled += 1;
            }
        }
        if !owed.is_empty() {
            tracing::info!(owed = owed.len(), settled, "refund sweep finished");
        }
        Ok(settled)
    }
}

/// Periodically retries owed refunds until shutdown. A zero interval disables it.
pub fn spawn_refund_sweeper(
    compensator: Compensator,
    interval: Duration,
    mut shutdown: Shutdown,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        tracing::info!("refund sweeper disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(err) = compensator.sweep().await {
                        tracing::warn!(?err, "refund sweep failed");
                    }
                }
            }
        }
        tracing::debug!("refund sweeper stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_derived_from_the_message_id() {
        let id = Uuid::nil();
        assert_eq!(
            debit_reference(id),
            "message:00000000-0000-0000-0000-000000000000:debit"
        );
        assert_eq!(
            refund_reference(id),
            "message:00000000-0000-0000-0000-000000000000:refund"
        );
    }

    #[test]
    fn steps_render_as_snake_case() {
        assert_eq!(SagaStep::AwaitStatus.to_string(), "await_status");
    }
}
