use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// key: ledger-models -> clients,price-plans,journal
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub client_id: String,
    pub balance_minor: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricePlan {
    pub client_id: String,
    pub normal_price_minor: i64,
    pub priority_price_minor: i64,
}

/// Append-only journal entry. Positive amounts credit the client, negative amounts debit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub id: i64,
    pub client_id: String,
    pub amount_minor: i64,
    pub kind: TransactionKind,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Debit,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Debit => "DEBIT",
            TransactionKind::Refund => "REFUND",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "DEBIT" => Some(TransactionKind::Debit),
            "REFUND" => Some(TransactionKind::Refund),
            _ => None,
        }
    }

    /// Journal amount for a posting of `amount` minor units.
    pub fn signed_amount(&self, amount: i64) -> i64 {
        match self {
            TransactionKind::Debit => -amount,
            TransactionKind::Refund => amount,
        }
    }
}

/// Input of a create-or-reset call.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NewClient {
    pub client_id: String,
    pub initial_balance_minor: i64,
    pub normal_price_minor: i64,
    pub priority_price_minor: i64,
}

/// A balance movement requested against one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub kind: TransactionKind,
    pub amount_minor: i64,
    pub reference: String,
}

impl Posting {
    pub fn debit(amount_minor: i64, reference: impl Into<String>) -> Self {
        Self {
            kind: TransactionKind::Debit,
            amount_minor,
            reference: reference.into(),
        }
    }

    pub fn refund(amount_minor: i64, reference: impl Into<String>) -> Self {
        Self {
            kind: TransactionKind::Refund,
            amount_minor,
            reference: reference.into(),
        }
    }

    /// Refunds carrying a reference are replay-safe: the same reference credits once.
    pub fn is_replayable(&self) -> bool {
        self.kind == TransactionKind::Refund && !self.reference.is_empty()
    }

    /// Balance after applying this posting. Must run while the client lock is held.
    pub fn apply_to(&self, balance: i64) -> Result<i64, LedgerError> {
        match self.kind {
            TransactionKind::Debit => {
                if balance < self.amount_minor {
                    return Err(LedgerError::InsufficientFunds {
                        balance,
                        requested: self.amount_minor,
                    });
                }
                Ok(balance - self.amount_minor)
            }
            TransactionKind::Refund => balance
                .checked_add(self.amount_minor)
                .ok_or_else(|| LedgerError::InvalidArgument("balance overflow".into())),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("client not found: {0}")]
    NotFound(String),
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
