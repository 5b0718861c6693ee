use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use super::api::{MoneyRequest, MoneyResponse};
use super::models::{LedgerError, PricePlan};
use super::service::LedgerService;

#[derive(Debug, Error)]
pub enum LedgerClientError {
    #[error("client not found")]
    NotFound,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("ledger rejected request: {0}")]
    Rejected(String),
    #[error("ledger transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("ledger internal error: {0}")]
    Internal(String),
}

/// key: ledger-client -> orchestrator side of the ledger boundary
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn debit(
        &self,
        client_id: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError>;

    async fn refund(
        &self,
        client_id: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError>;

    async fn price_plan(&self, client_id: &str) -> Result<PricePlan, LedgerClientError>;
}

/// Talks to `ledger_server` over its JSON API.
#[derive(Clone)]
pub struct HttpLedgerClient {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    detail: Option<String>,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("ledger url `{base_url}` cannot be used as a base url");
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, client_id: &str, action: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("clients").push(client_id);
            if !action.is_empty() {
                segments.push(action);
            }
        }
        url
    }

    async fn post_money(
        &self,
        client_id: &str,
        action: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError> {
        let response = self
            .http
            .post(self.endpoint(client_id, action))
            .json(&MoneyRequest {
                amount_minor,
                reference: reference.to_string(),
            })
            .send()
            .await?;
        let body: MoneyResponse = read_response(response).await?;
        Ok(body.balance_after)
    }
}

async fn read_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, LedgerClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.json::<ErrorBody>().await.ok();
    let code = body.as_ref().map(|b| b.error.as_str()).unwrap_or_default();
    let detail = body
        .as_ref()
        .and_then(|b| b.detail.clone())
        .unwrap_or_else(|| status.to_string());

    match (status, code) {
        (StatusCode::NOT_FOUND, _) => Err(LedgerClientError::NotFound),
        (_, "insufficient_funds") => Err(LedgerClientError::InsufficientFunds),
        (status, _) if status.is_client_error() => Err(LedgerClientError::Rejected(detail)),
        _ => Err(LedgerClientError::Internal(detail)),
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn debit(
        &self,
        client_id: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError> {
        self.post_money(client_id, "debit", amount_minor, reference)
            .await
    }

    async fn refund(
        &self,
        client_id: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError> {
        self.post_money(client_id, "refund", amount_minor, reference)
            .await
    }

    async fn price_plan(&self, client_id: &str) -> Result<PricePlan, LedgerClientError> {
        let response = self
            .http
            .get(self.endpoint(client_id, "price-plan"))
            .send()
            .await?;
        read_response(response).await
    }
}

impl From<LedgerError> for LedgerClientError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(_) => LedgerClientError::NotFound,
            LedgerError::InsufficientFunds { .. } => LedgerClientError::InsufficientFunds,
            LedgerError::InvalidArgument(detail) => LedgerClientError::Rejected(detail),
            LedgerError::Db(err) => LedgerClientError::Internal(err.to_string()),
        }
    }
}

/// In-process binding, used when the orchestrator and the ledger share a process.
#[async_trait]
impl LedgerClient for LedgerService {
    async fn debit(
        &self,
        client_id: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError> {
        Ok(LedgerService::debit(self, client_id, amount_minor, reference).await?)
    }

    async fn refund(
        &self,
        client_id: &str,
        amount_minor: i64,
        reference: &str,
    ) -> Result<i64, LedgerClientError> {
        Ok(LedgerService::refund(self, client_id, amount_minor, reference).await?)
    }

    async fn price_plan(&self, client_id: &str) -> Result<PricePlan, LedgerClientError> {
        Ok(self.get_price_plan(client_id).await?)
    }
}
