//! Balance ledger: per-client balances, price plans, and the append-only journal.

pub mod api;
pub mod client;
pub mod memory;
pub mod models;
pub mod service;
pub mod store;

pub use client::{HttpLedgerClient, LedgerClient, LedgerClientError};
pub use memory::InMemoryLedgerStore;
pub use models::{
    Client, LedgerError, LedgerResult, LedgerTransaction, NewClient, Posting, PricePlan,
    TransactionKind,
};
pub use service::LedgerService;
pub use store::{LedgerStore, PgLedgerStore};
