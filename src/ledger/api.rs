use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{LedgerTransaction, NewClient, PricePlan};
use super::service::LedgerService;
use crate::error::AppResult;

/// key: ledger-api -> request/response surface used by the orchestrator
pub fn routes() -> Router {
    Router::new()
        .route("/clients", post(create_client))
        .route("/clients/:id", get(get_client))
        .route(
            "/clients/:id/price-plan",
            get(get_price_plan).put(set_price_plan),
        )
        .route("/clients/:id/debit", post(debit))
        .route("/clients/:id/refund", post(refund))
        .route("/clients/:id/transactions", get(list_transactions))
}

pub fn router(service: LedgerService) -> Router {
    routes()
        .merge(crate::routes::health_routes())
        .layer(Extension(service))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateClientResponse {
    pub client_id: String,
    pub balance_minor: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub client_id: String,
    pub balance_minor: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPricePlanRequest {
    pub normal_price_minor: i64,
    pub priority_price_minor: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoneyRequest {
    pub amount_minor: i64,
    #[serde(default, rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MoneyResponse {
    pub balance_after: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<i64>,
}

pub async fn create_client(
    Extension(ledger): Extension<LedgerService>,
    payload: Result<Json<NewClient>, JsonRejection>,
) -> AppResult<Json<CreateClientResponse>> {
    let Json(payload) = payload?;
    let client = ledger.create_client(payload).await?;
    Ok(Json(CreateClientResponse {
        client_id: client.client_id,
        balance_minor: client.balance_minor,
    }))
}

pub async fn get_client(
    Extension(ledger): Extension<LedgerService>,
    Path(client_id): Path<String>,
) -> AppResult<Json<ClientEnvelope>> {
    let client = ledger.get_client(&client_id).await?;
    Ok(Json(ClientEnvelope {
        client_id: client.client_id,
        balance_minor: client.balance_minor,
        created_at: client.created_at,
        updated_at: client.updated_at,
    }))
}

pub async fn get_price_plan(
    Extension(ledger): Extension<LedgerService>,
    Path(client_id): Path<String>,
) -> AppResult<Json<PricePlan>> {
    Ok(Json(ledger.get_price_plan(&client_id).await?))
}

pub async fn set_price_plan(
    Extension(ledger): Extension<LedgerService>,
    Path(client_id): Path<String>,
    payload: Result<Json<SetPricePlanRequest>, JsonRejection>,
) -> AppResult<Json<PricePlan>> {
    let Json(payload) = payload?;
    let plan = ledger
        .set_price_plan(
            &client_id,
            payload.normal_price_minor,
            payload.priority_price_minor,
        )
        .await?;
    Ok(Json(plan))
}

pub async fn debit(
    Extension(ledger): Extension<LedgerService>,
    Path(client_id): Path<String>,
    payload: Result<Json<MoneyRequest>, JsonRejection>,
) -> AppResult<Json<MoneyResponse>> {
    let Json(payload) = payload?;
    let balance_after = ledger
        .debit(&client_id, payload.amount_minor, &payload.reference)
        .await?;
    Ok(Json(MoneyResponse { balance_after }))
}

pub async fn refund(
    Extension(ledger): Extension<LedgerService>,
    Path(client_id): Path<String>,
    payload: Result<Json<MoneyRequest>, JsonRejection>,
) -> AppResult<Json<MoneyResponse>> {
    let Json(payload) = payload?;
    let balance_after = ledger
        .refund(&client_id, payload.amount_minor, &payload.reference)
        .await?;
    Ok(Json(MoneyResponse { balance_after }))
}

pub async fn list_transactions(
    Extension(ledger): Extension<LedgerService>,
    Path(client_id): Path<String>,
    Query(query): Query<TransactionsQuery>,
) -> AppResult<Json<Vec<LedgerTransaction>>> {
    Ok(Json(ledger.transactions(&client_id, query.limit).await?))
}
