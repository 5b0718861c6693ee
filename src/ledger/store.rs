use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::models::{
    Client, LedgerError, LedgerResult, LedgerTransaction, NewClient, Posting, PricePlan,
    TransactionKind,
};

/// key: ledger-store -> atomic units of work over client rows
///
/// Every mutating call is a single atomic unit. `post` must take the client's exclusive
/// lock before reading the balance and keep it until the new balance and the journal
/// entry are durable.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn upsert_client(&self, client: &NewClient) -> LedgerResult<Client>;
    async fn set_price_plan(
        &self,
        client_id: &str,
        normal_price_minor: i64,
        priority_price_minor: i64,
    ) -> LedgerResult<PricePlan>;
    async fn get_client(&self, client_id: &str) -> LedgerResult<Client>;
    async fn get_price_plan(&self, client_id: &str) -> LedgerResult<PricePlan>;
    async fn post(&self, client_id: &str, posting: &Posting) -> LedgerResult<i64>;
    async fn transactions(
        &self,
        client_id: &str,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerTransaction>>;
}

/// Postgres-backed ledger. Row locks come from `SELECT ... FOR UPDATE`.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: i64,
    client_id: String,
    amount_minor: i64,
    kind: String,
    reference: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let kind = TransactionKind::from_str(&row.kind).ok_or_else(|| {
            LedgerError::Db(sqlx::Error::Decode(
                format!("unknown transaction kind `{}`", row.kind).into(),
            ))
        })?;
        Ok(LedgerTransaction {
            id: row.id,
            client_id: row.client_id,
            amount_minor: row.amount_minor,
            kind,
            reference: row.reference,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn upsert_client(&self, client: &NewClient) -> LedgerResult<Client> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, Client>(
            r#"
            INSERT INTO clients (client_id, balance_minor)
            VALUES ($1, $2)
            ON CONFLICT (client_id)
            DO UPDATE SET
                balance_minor = EXCLUDED.balance_minor,
                updated_at = NOW()
            RETURNING client_id, balance_minor, created_at, updated_at
            "#,
        )
        .bind(&client.client_id)
        .bind(client.initial_balance_minor)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO price_plans (client_id, normal_price_minor, priority_price_minor)
            VALUES ($1, $2, $3)
            ON CONFLICT (client_id)
            DO UPDATE SET
                normal_price_minor = EXCLUDED.normal_price_minor,
                priority_price_minor = EXCLUDED.priority_price_minor,
                updated_at = NOW()
            "#,
        )
        .bind(&client.client_id)
        .bind(client.normal_price_minor)
        .bind(client.priority_price_minor)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn set_price_plan(
        &self,
        client_id: &str,
        normal_price_minor: i64,
        priority_price_minor: i64,
    ) -> LedgerResult<PricePlan> {
        let plan = sqlx::query_as::<_, PricePlan>(
            r#"
            UPDATE price_plans
            SET normal_price_minor = $2, priority_price_minor = $3, updated_at = NOW()
            WHERE client_id = $1
            RETURNING client_id, normal_price_minor, priority_price_minor
            "#,
        )
        .bind(client_id)
        .bind(normal_price_minor)
        .bind(priority_price_minor)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| LedgerError::NotFound(client_id.to_string()))
    }

    async fn get_client(&self, client_id: &str) -> LedgerResult<Client> {
        sqlx::query_as::<_, Client>(
            "SELECT client_id, balance_minor, created_at, updated_at FROM clients WHERE client_id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(client_id.to_string()))
    }

    async fn get_price_plan(&self, client_id: &str) -> LedgerResult<PricePlan> {
        sqlx::query_as::<_, PricePlan>(
            "SELECT client_id, normal_price_minor, priority_price_minor FROM price_plans WHERE client_id = $1",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(client_id.to_string()))
    }

    async fn post(&self, client_id: &str, posting: &Posting) -> LedgerResult<i64> {
        let mut tx = self.pool.begin().await?;

        // The row lock is held until commit or rollback (drop).
        let balance: i64 = sqlx::query_scalar::<_, i64>(
            "SELECT balance_minor FROM clients WHERE client_id = $1 FOR UPDATE",
        )
        .bind(client_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::NotFound(client_id.to_string()))?;

        if posting.is_replayable() {
            let seen = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM ledger_transactions WHERE client_id = $1 AND kind = 'REFUND' AND reference = $2",
            )
            .bind(client_id)
            .bind(&posting.reference)
            .fetch_optional(&mut *tx)
            .await?;
            if seen.is_some() {
                tx.rollback().await?;
                return Ok(balance);
            }
        }

        let balance_after = posting.apply_to(balance)?;

        sqlx::query("UPDATE clients SET balance_minor = $2, updated_at = NOW() WHERE client_id = $1")
            .bind(client_id)
            .bind(balance_after)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO ledger_transactions (client_id, amount_minor, kind, reference) VALUES ($1, $2, $3, $4)",
        )
        .bind(client_id)
        .bind(posting.kind.signed_amount(posting.amount_minor))
        .bind(posting.kind.as_str())
        .bind(&posting.reference)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(balance_after)
    }

    async fn transactions(
        &self,
        client_id: &str,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerTransaction>> {
        self.get_client(client_id).await?;
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, client_id, amount_minor, kind, reference, created_at
            FROM ledger_transactions
            WHERE client_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(client_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerTransaction::try_from).collect()
    }
}
