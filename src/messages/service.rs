use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::models::{Message, MessageFilter, MessageKind, Page, MAX_BODY_CHARS};
use super::publisher::{PublishQueue, QueueError};
use super::saga::{debit_reference, Compensator, SagaStep};
use super::store::MessageStore;
use crate::error::{AppError, AppResult};
use crate::ledger::{LedgerClient, LedgerClientError};

/// Where the per-message price comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pricing {
    /// Flat prices from configuration.
    Configured { normal_minor: i64, priority_minor: i64 },
    /// The client's price plan, fetched from the ledger for each submission.
    ClientPlan,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitMessage {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// key: message-orchestrator -> debit-before-publish submission
#[derive(Clone)]
pub struct MessageService {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn MessageStore>,
    queue: PublishQueue,
    pricing: Pricing,
    compensator: Compensator,
}

impl MessageService {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn MessageStore>,
        queue: PublishQueue,
        pricing: Pricing,
    ) -> Self {
        let compensator = Compensator::new(ledger.clone(), store.clone());
        Self {
            ledger,
            store,
            queue,
            pricing,
            compensator,
        }
    }

    pub fn compensator(&self) -> Compensator {
        self.compensator.clone()
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    /// Charges the client and hands the message to the publish pipeline.
    ///
    /// Nothing is charged when validation fails or the publish queue has no room. Once
    /// the debit succeeds the message either reaches the queue or the money is refunded.
    pub async fn submit(&self, client_id: &str, request: SubmitMessage) -> AppResult<Message> {
        let kind = validate(client_id, &request)?;

        let slot = self.queue.reserve().await.map_err(|err| match err {
            QueueError::Full => AppError::PublishQueueFull,
            QueueError::Closed => AppError::Message(err.to_string()),
        })?;

        let id = Uuid::new_v4();
        let price = self.price_for(client_id, kind).await?;

        match self
            .ledger
            .debit(client_id, price, &debit_reference(id))
            .await
        {
            Ok(balance) => tracing::info!(
                %client_id,
                message_id = %id,
                price,
                balance_after = balance,
                step = %SagaStep::Debit,
                "message charged"
            ),
            Err(LedgerClientError::InsufficientFunds) => {
                tracing::info!(%client_id, price, "submission rejected, insufficient funds");
                return Err(AppError::PaymentRequired);
            }
            Err(err) => {
                tracing::error!(%client_id, error = %err, step = %SagaStep::Debit, "debit failed");
                return Err(err.into());
            }
        }

        let message = Message::new(
            id,
            client_id.to_string(),
            request.to.trim().to_string(),
            request.body,
            kind,
            price,
            Utc::now(),
        );
        if let Err(err) = self.store.insert(&message).await {
            tracing::error!(
                %client_id,
                message_id = %id,
                error = %err,
                step = %SagaStep::Persist,
                "failed to record message, refunding"
            );
            let _ = self
                .compensator
                .refund_unrecorded(client_id, id, price)
                .await;
            return Err(AppError::Db(err));
        }

        slot.send(message.clone());
        Ok(message)
    }

    async fn price_for(&self, client_id: &str, kind: MessageKind) -> AppResult<i64> {
        match &self.pricing {
            Pricing::Configured {
                normal_minor,
                priority_minor,
            } => Ok(match kind {
                MessageKind::Normal => *normal_minor,
                MessageKind::Priority => *priority_minor,
            }),
            Pricing::ClientPlan => {
                let plan = self.ledger.price_plan(client_id).await?;
                Ok(match kind {
                    MessageKind::Normal => plan.normal_price_minor,
                    MessageKind::Priority => plan.priority_price_minor,
                })
            }
        }
    }

    pub async fn list(
        &self,
        client_id: &str,
        filter: &MessageFilter,
        page: Page,
    ) -> AppResult<Vec<Message>> {
        Ok(self.store.list(client_id, filter, page).await?)
    }

    /// Malformed ids are reported as missing.
    pub async fn get(&self, id: &str) -> AppResult<Message> {
        let id = Uuid::parse_str(id.trim()).map_err(|_| AppError::NotFound)?;
        self.store.get(id).await?.ok_or(AppError::NotFound)
    }
}

fn validate(client_id: &str, request: &SubmitMessage) -> AppResult<MessageKind> {
    if client_id.trim().is_empty() {
        return Err(AppError::BadRequest("missing X-Client-ID".into()));
    }
    if request.to.trim().is_empty() {
        return Err(AppError::BadRequest("recipient `to` is required".into()));
    }
    if request.body.is_empty() {
        return Err(AppError::BadRequest("body is required".into()));
    }
    if request.body.chars().count() > MAX_BODY_CHARS {
        return Err(AppError::BadRequest(format!(
            "single-page only (<= {MAX_BODY_CHARS} chars)"
        )));
    }
    match request.kind.as_deref().map(str::trim) {
        None | Some("") => Ok(MessageKind::Normal),
        Some(value) => MessageKind::parse(value)
            .ok_or_else(|| AppError::BadRequest("type must be NORMAL or PRIORITY".into())),
    }
}
