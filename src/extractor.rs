use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Caller identity taken from the `X-Client-ID` header. The value is trusted as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ClientId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(CLIENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();
        if value.is_empty() {
            return Err(AppError::BadRequest("missing X-Client-ID".into()));
        }
        Ok(ClientId(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn client_id_parsed_from_header() {
        let request = Request::builder()
            .header("X-Client-ID", " c1 ")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let client = ClientId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client, ClientId("c1".into()));
    }

    #[tokio::test]
    async fn missing_header_rejected() {
        let request = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let res = ClientId::from_request_parts(&mut parts, &()).await;
        assert!(matches!(res, Err(AppError::BadRequest(_))));
    }
}
