use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::models::{
    Message, MessageFilter, MessageKind, MessageStatus, Page, RefundState, Transition,
};
use crate::events::StatusEvent;

/// Result of applying a terminal or intermediate status to a stored message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusOutcome {
    Missing,
    Ignored { current: MessageStatus },
    Applied { message: Message, refund_owed: bool },
}

/// key: message-store -> durable message lifecycle
///
/// Status changes lock the row, so a concurrent event for the same message waits for the
/// first one to commit and then observes its result.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &Message) -> sqlx::Result<()>;
    async fn get(&self, id: Uuid) -> sqlx::Result<Option<Message>>;
    async fn list(
        &self,
        client_id: &str,
        filter: &MessageFilter,
        page: Page,
    ) -> sqlx::Result<Vec<Message>>;
    /// Returns false when the row is missing or has already left CREATED.
    async fn mark_queued(&self, id: Uuid) -> sqlx::Result<bool>;
    async fn mark_failed_to_queue(&self, id: Uuid) -> sqlx::Result<StatusOutcome>;
    async fn apply_status(&self, event: &StatusEvent) -> sqlx::Result<StatusOutcome>;
    /// Oldest first.
    async fn refunds_owed(&self, limit: i64) -> sqlx::Result<Vec<Message>>;
    /// OWED -> SETTLED. Returns false when nothing was owed.
    async fn settle_refund(&self, id: Uuid) -> sqlx::Result<bool>;
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> sqlx::Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn save_transition(
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = $2, operator = $3, refund_state = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(message.id)
        .bind(message.status.as_str())
        .bind(&message.operator)
        .bind(message.refund_state.as_str())
        .bind(message.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut Message) -> Transition + Send,
    ) -> sqlx::Result<StatusOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(mut message) = Self::lock(&mut tx, id).await? else {
            tx.rollback().await?;
            return Ok(StatusOutcome::Missing);
        };
        match apply(&mut message) {
            Transition::Ignored { current } => {
                tx.rollback().await?;
                Ok(StatusOutcome::Ignored { current })
            }
            Transition::Applied { refund_owed, .. } => {
                Self::save_transition(&mut tx, &message).await?;
                tx.commit().await?;
                Ok(StatusOutcome::Applied {
                    message,
                    refund_owed,
                })
            }
        }
    }
}

const MESSAGE_COLUMNS: &str = "id, client_id, recipient, body, kind, price_minor, status, operator, refund_state, created_at, updated_at";

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    client_id: String,
    recipient: String,
    body: String,
    kind: String,
    price_minor: i64,
    status: String,
    operator: Option<String>,
    refund_state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode_error(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("unknown {column} `{value}`").into())
}

impl TryFrom<MessageRow> for Message {
    type Error = sqlx::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            kind: MessageKind::parse(&row.kind).ok_or_else(|| decode_error("kind", &row.kind))?,
            status: MessageStatus::parse(&row.status)
                .ok_or_else(|| decode_error("status", &row.status))?,
            refund_state: RefundState::parse(&row.refund_state)
                .ok_or_else(|| decode_error("refund_state", &row.refund_state))?,
            client_id: row.client_id,
            to: row.recipient,
            body: row.body,
            price_minor: row.price_minor,
            operator: row.operator,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn insert(&self, message: &Message) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, client_id, recipient, body, kind, price_minor, status, operator, refund_state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(message.id)
        .bind(&message.client_id)
        .bind(&message.to)
        .bind(&message.body)
        .bind(message.kind.as_str())
        .bind(message.price_minor)
        .bind(message.status.as_str())
        .bind(&message.operator)
        .bind(message.refund_state.as_str())
        .bind(message.created_at)
        .bind(message.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> sqlx::Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Message::try_from).transpose()
    }

    async fn list(
        &self,
        client_id: &str,
        filter: &MessageFilter,
        page: Page,
    ) -> sqlx::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE client_id = $1
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(client_id)
        .bind(filter.kind.map(|kind| kind.as_str()))
        .bind(filter.status.map(|status| status.as_str()))
        .bind(i64::from(page.limit))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn mark_queued(&self, id: Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = 'QUEUED', updated_at = NOW() WHERE id = $1 AND status = 'CREATED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed_to_queue(&self, id: Uuid) -> sqlx::Result<StatusOutcome> {
        self.transition(id, |message| message.fail_to_queue(Utc::now()))
            .await
    }

    async fn apply_status(&self, event: &StatusEvent) -> sqlx::Result<StatusOutcome> {
        self.transition(event.message_id, |message| {
            message.apply_event(event, Utc::now())
        })
        .await
    }

    async fn refunds_owed(&self, limit: i64) -> sqlx::Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE refund_state = 'OWED' ORDER BY updated_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Message::try_from).collect()
    }

    async fn settle_refund(&self, id: Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET refund_state = 'SETTLED', updated_at = NOW() WHERE id = $1 AND refund_state = 'OWED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
