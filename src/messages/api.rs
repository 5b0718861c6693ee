use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::{Message, MessageFilter, MessageKind, MessageStatus, Page};
use super::service::{MessageService, SubmitMessage};
use crate::error::AppResult;
use crate::extractor::ClientId;

pub fn routes() -> Router {
    Router::new()
        .route("/messages", get(list_messages).post(submit_message))
        .route("/messages/:id", get(get_message))
}

pub fn router(service: MessageService) -> Router {
    routes()
        .merge(crate::routes::health_routes())
        .layer(Extension(service))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: MessageStatus,
}

/// Everything is read as text so that malformed values fall back to defaults instead of
/// failing the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<String>,
    pub page: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
}

impl ListQuery {
    fn page(&self) -> Page {
        let number = |value: &Option<String>| value.as_deref().and_then(|v| v.trim().parse().ok());
        Page::new(number(&self.page), number(&self.limit))
    }

    fn filter(&self) -> MessageFilter {
        MessageFilter {
            kind: self.kind.as_deref().and_then(MessageKind::parse),
            status: self.status.as_deref().and_then(MessageStatus::parse),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageList {
    pub items: Vec<Message>,
    pub page: u32,
    pub limit: u32,
    pub count: usize,
}

pub async fn submit_message(
    Extension(service): Extension<MessageService>,
    ClientId(client_id): ClientId,
    payload: Result<Json<SubmitMessage>, JsonRejection>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(payload) = payload?;
    let message = service.submit(&client_id, payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id: message.id,
            status: message.status,
        }),
    ))
}

pub async fn list_messages(
    Extension(service): Extension<MessageService>,
    ClientId(client_id): ClientId,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<MessageList>> {
    let page = query.page();
    let items = service.list(&client_id, &query.filter(), page).await?;
    Ok(Json(MessageList {
        count: items.len(),
        items,
        page: page.page,
        limit: page.limit,
    }))
}

pub async fn get_message(
    Extension(service): Extension<MessageService>,
    Path(id): Path<String>,
) -> AppResult<Json<Message>> {
    Ok(Json(service.get(&id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_query_values_fall_back() {
        let query = ListQuery {
            limit: Some("abc".into()),
            page: Some("-3".into()),
            kind: Some("bulk".into()),
            status: Some("delivered".into()),
        };
        assert_eq!(query.page(), Page { page: 0, limit: 20 });
        let filter = query.filter();
        assert_eq!(filter.kind, None);
        assert_eq!(filter.status, Some(MessageStatus::Delivered));
    }
}
