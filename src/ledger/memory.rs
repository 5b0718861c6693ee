use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::models::{
    Client, LedgerError, LedgerResult, LedgerTransaction, NewClient, Posting, PricePlan,
    TransactionKind,
};
use super::store::LedgerStore;

struct Account {
    client: Client,
    plan: PricePlan,
}

/// Process-local ledger. Each client row sits behind its own async mutex, so postings
/// against one client serialize while different clients proceed in parallel.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    accounts: DashMap<String, Arc<Mutex<Account>>>,
    journal: StdMutex<Vec<LedgerTransaction>>,
    next_id: AtomicI64,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, client_id: &str) -> LedgerResult<Arc<Mutex<Account>>> {
        // Clone the Arc out so no map guard is held across an await.
        self.accounts
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LedgerError::NotFound(client_id.to_string()))
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Vec<LedgerTransaction>> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_client(&self, client: &NewClient) -> LedgerResult<Client> {
        let now = Utc::now();
        let account = self
            .accounts
            .entry(client.client_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Account {
                    client: Client {
                        client_id: client.client_id.clone(),
                        balance_minor: 0,
                        created_at: now,
                        updated_at: now,
                    },
                    plan: PricePlan {
                        client_id: client.client_id.clone(),
                        normal_price_minor: 0,
                        priority_price_minor: 0,
                    },
                }))
            })
            .value()
            .clone();

        let mut guard = account.lock().await;
        guard.client.balance_minor = client.initial_balance_minor;
        guard.client.updated_at = now;
        guard.plan.normal_price_minor = client.normal_price_minor;
        guard.plan.priority_price_minor = client.priority_price_minor;
        Ok(guard.client.clone())
    }

    async fn set_price_plan(
        &self,
        client_id: &str,
        normal_price_minor: i64,
        priority_price_minor: i64,
    ) -> LedgerResult<PricePlan> {
        let account = self.account(client_id)?;
        let mut guard = account.lock().await;
        guard.plan.normal_price_minor = normal_price_minor;
        guard.plan.priority_price_minor = priority_price_minor;
        Ok(guard.plan.clone())
    }

    async fn get_client(&self, client_id: &str) -> LedgerResult<Client> {
        let account = self.account(client_id)?;
        let guard = account.lock().await;
        Ok(guard.client.clone())
    }

    async fn get_price_plan(&self, client_id: &str) -> LedgerResult<PricePlan> {
        let account = self.account(client_id)?;
        let guard = account.lock().await;
        Ok(guard.plan.clone())
    }

    async fn post(&self, client_id: &str, posting: &Posting) -> LedgerResult<i64> {
        let account = self.account(client_id)?;
        let mut guard = account.lock().await;
        let balance = guard.client.balance_minor;

        if posting.is_replayable() {
            let seen = self.journal().iter().any(|entry| {
                entry.client_id == client_id
                    && entry.kind == TransactionKind::Refund
                    && entry.reference == posting.reference
            });
            if seen {
                return Ok(balance);
            }
        }

        let balance_after = posting.apply_to(balance)?;
        let now = Utc::now();
        guard.client.balance_minor = balance_after;
        guard.client.updated_at = now;
        self.journal().push(LedgerTransaction {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            client_id: client_id.to_string(),
            amount_minor: posting.kind.signed_amount(posting.amount_minor),
            kind: posting.kind,
            reference: posting.reference.clone(),
            created_at: now,
        });
        Ok(balance_after)
    }

    async fn transactions(
        &self,
        client_id: &str,
        limit: i64,
    ) -> LedgerResult<Vec<LedgerTransaction>> {
        self.account(client_id)?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .journal()
            .iter()
            .rev()
            .filter(|entry| entry.client_id == client_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
