use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ledger::{LedgerClientError, LedgerError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("ledger call failed: {0}")]
    LedgerClient(#[from] LedgerClientError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("insufficient funds")]
    PaymentRequired,
    #[error("publish queue is full, retry later")]
    PublishQueueFull,
    #[error("{0}")]
    Message(String),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound | AppError::Ledger(LedgerError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Ledger(LedgerError::InvalidArgument(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_argument")
            }
            AppError::Ledger(LedgerError::InsufficientFunds { .. }) => {
                (StatusCode::PRECONDITION_FAILED, "insufficient_funds")
            }
            AppError::PaymentRequired => (StatusCode::PAYMENT_REQUIRED, "insufficient_funds"),
            AppError::PublishQueueFull => (StatusCode::SERVICE_UNAVAILABLE, "publish_queue_full"),
            AppError::Db(_)
            | AppError::Ledger(LedgerError::Db(_))
            | AppError::LedgerClient(_)
            | AppError::Message(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = Json(json!({
            "error": code,
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
