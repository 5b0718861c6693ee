use std::sync::Arc;

use tracing::{info, warn};

use super::models::{
    Client, LedgerError, LedgerResult, LedgerTransaction, NewClient, Posting, PricePlan,
};
use super::store::LedgerStore;

pub const DEFAULT_TRANSACTION_PAGE: i64 = 50;
pub const MAX_TRANSACTION_PAGE: i64 = 500;

/// key: ledger-service -> balance of record
///
/// Validates arguments and delegates each operation to one atomic unit of the store.
/// Nothing here retries: every failure is returned to the caller as a definitive
/// outcome so the caller can decide whether to compensate.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Creates the client, or overwrites balance and prices when it already exists.
    pub async fn create_client(&self, request: NewClient) -> LedgerResult<Client> {
        require_client_id(&request.client_id)?;
        require_non_negative("initial_balance_minor", request.initial_balance_minor)?;
        require_non_negative("normal_price_minor", request.normal_price_minor)?;
        require_non_negative("priority_price_minor", request.priority_price_minor)?;

        let client = self.store.upsert_client(&request).await?;
        info!(
            client_id = %client.client_id,
            balance = client.balance_minor,
            normal_price = request.normal_price_minor,
            priority_price = request.priority_price_minor,
            "client initialized"
        );
        Ok(client)
    }

    /// Replaces the price plan without touching the balance.
    pub async fn set_price_plan(
        &self,
        client_id: &str,
        normal_price_minor: i64,
        priority_price_minor: i64,
    ) -> LedgerResult<PricePlan> {
        require_client_id(client_id)?;
        require_non_negative("normal_price_minor", normal_price_minor)?;
        require_non_negative("priority_price_minor", priority_price_minor)?;
        let plan = self
            .store
            .set_price_plan(client_id, normal_price_minor, priority_price_minor)
            .await?;
        info!(%client_id, normal_price_minor, priority_price_minor, "price plan updated");
        Ok(plan)
    }

    pub async fn get_client(&self, client_id: &str) -> LedgerResult<Client> {
        self.store.get_client(client_id).await
    }

    pub async fn get_price_plan(&self, client_id: &str) -> LedgerResult<PricePlan> {
        self.store.get_price_plan(client_id).await
    }

    pub async fn debit(&self, client_id: &str, amount_minor: i64, reference: &str) -> LedgerResult<i64> {
        require_non_negative("amount_minor", amount_minor)?;
        match self
            .store
            .post(client_id, &Posting::debit(amount_minor, reference))
            .await
        {
            Ok(balance_after) => {
                info!(%client_id, amount_minor, %reference, balance_after, "debit applied");
                Ok(balance_after)
            }
            Err(err @ LedgerError::InsufficientFunds { .. }) => {
                warn!(%client_id, amount_minor, %reference, "debit rejected: insufficient funds");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn refund(&self, client_id: &str, amount_minor: i64, reference: &str) -> LedgerResult<i64> {
        require_non_negative("amount_minor", amount_minor)?;
        let balance_after = self
            .store
            .post(client_id, &Posting::refund(amount_minor, reference))
            .await?;
        info!(%client_id, amount_minor, %reference, balance_after, "refund applied");
        Ok(balance_after)
    }

    pub async fn transactions(
        &self,
        client_id: &str,
        limit: Option<i64>,
    ) -> LedgerResult<Vec<LedgerTransaction>> {
        let limit = match limit {
            Some(value) if value > 0 => value.min(MAX_TRANSACTION_PAGE),
            _ => DEFAULT_TRANSACTION_PAGE,
        };
        self.store.transactions(client_id, limit).await
    }
}

fn require_client_id(client_id: &str) -> LedgerResult<()> {
    if client_id.trim().is_empty() {
        return Err(LedgerError::InvalidArgument("client_id required".into()));
    }
    Ok(())
}

fn require_non_negative(field: &str, value: i64) -> LedgerResult<()> {
    if value < 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "{field} must be non-negative"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedgerStore;
    use crate::ledger::models::TransactionKind;

    fn service() -> LedgerService {
        LedgerService::new(Arc::new(InMemoryLedgerStore::new()))
    }

    async fn seeded(balance: i64) -> LedgerService {
        let ledger = service();
        ledger
            .create_client(NewClient {
                client_id: "c1".into(),
                initial_balance_minor: balance,
                normal_price_minor: 100,
                priority_price_minor: 250,
            })
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn debit_then_refund_restores_balance() {
        let ledger = seeded(1000).await;
        for amount in [0, 1, 250, 1000] {
            let debited = ledger.debit("c1", amount, "").await.unwrap();
            assert_eq!(debited, 1000 - amount);
            let refunded = ledger.refund("c1", amount, "").await.unwrap();
            assert_eq!(refunded, 1000);
        }
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_trace() {
        let ledger = seeded(50).await;
        let err = ledger.debit("c1", 100, "").await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { balance: 50, requested: 100 }));
        assert_eq!(ledger.get_client("c1").await.unwrap().balance_minor, 50);
        assert!(ledger.transactions("c1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn journal_records_signed_amounts_newest_first() {
        let ledger = seeded(500).await;
        ledger.debit("c1", 120, "message:a:debit").await.unwrap();
        ledger.refund("c1", 120, "message:a:refund").await.unwrap();

        let journal = ledger.transactions("c1", None).await.unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].kind, TransactionKind::Refund);
        assert_eq!(journal[0].amount_minor, 120);
        assert_eq!(journal[1].kind, TransactionKind::Debit);
        assert_eq!(journal[1].amount_minor, -120);
        assert_eq!(journal[1].reference, "message:a:debit");
    }

    #[tokio::test]
    async fn referenced_refund_replays_are_absorbed() {
        let ledger = seeded(0).await;
        assert_eq!(ledger.refund("c1", 100, "message:x:refund").await.unwrap(), 100);
        assert_eq!(ledger.refund("c1", 100, "message:x:refund").await.unwrap(), 100);
        assert_eq!(ledger.refund("c1", 100, "").await.unwrap(), 200);
        assert_eq!(ledger.refund("c1", 100, "").await.unwrap(), 300);
        assert_eq!(ledger.transactions("c1", None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let ledger = service();
        assert!(matches!(ledger.get_client("nope").await, Err(LedgerError::NotFound(_))));
        assert!(matches!(ledger.get_price_plan("nope").await, Err(LedgerError::NotFound(_))));
        assert!(matches!(ledger.debit("nope", 1, "").await, Err(LedgerError::NotFound(_))));
        assert!(matches!(ledger.refund("nope", 1, "").await, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let ledger = seeded(10).await;
        assert!(matches!(ledger.debit("c1", -5, "").await, Err(LedgerError::InvalidArgument(_))));
        assert!(matches!(ledger.refund("c1", -5, "").await, Err(LedgerError::InvalidArgument(_))));
        assert_eq!(ledger.get_client("c1").await.unwrap().balance_minor, 10);
    }

    #[tokio::test]
    async fn create_client_resets_balance_but_price_plan_update_does_not() {
        let ledger = seeded(1000).await;
        ledger.debit("c1", 300, "").await.unwrap();

        let plan = ledger.set_price_plan("c1", 80, 200).await.unwrap();
        assert_eq!(plan.normal_price_minor, 80);
        assert_eq!(ledger.get_client("c1").await.unwrap().balance_minor, 700);

        ledger
            .create_client(NewClient {
                client_id: "c1".into(),
                initial_balance_minor: 1000,
                normal_price_minor: 100,
                priority_price_minor: 250,
            })
            .await
            .unwrap();
        assert_eq!(ledger.get_client("c1").await.unwrap().balance_minor, 1000);
        assert_eq!(ledger.get_price_plan("c1").await.unwrap().priority_price_minor, 250);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_of_whole_balance_admit_exactly_one() {
        let ledger = seeded(100).await;
        let first = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.debit("c1", 100, "").await }
        });
        let second = tokio::spawn({
            let ledger = ledger.clone();
            async move { ledger.debit("c1", 100, "").await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let rejections = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(rejections, 1);
        assert_eq!(ledger.get_client("c1").await.unwrap().balance_minor, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_debits_never_overdraw() {
        let ledger = seeded(1000).await;
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.debit("c1", 70, "").await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 1000 / 70);
        let balance = ledger.get_client("c1").await.unwrap().balance_minor;
        assert_eq!(balance, 1000 - succeeded * 70);
        assert!(balance >= 0);
    }
}
