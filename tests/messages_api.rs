use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sms_gateway::app::embedded_ledger;
use sms_gateway::ledger::NewClient;
use sms_gateway::messages::{api, publish_queue, InMemoryMessageStore, MessageService, Pricing};
use tokio::sync::mpsc::Receiver;
use tower::ServiceExt;

async fn app(balance: i64) -> (Router, Receiver<sms_gateway::messages::Message>) {
    let ledger = embedded_ledger(Some(NewClient {
        client_id: "c1".into(),
        initial_balance_minor: balance,
        normal_price_minor: 100,
        priority_price_minor: 250,
    }))
    .await
    .unwrap();
    let (queue, rx) = publish_queue(64, Duration::from_millis(50));
    let service = MessageService::new(
        Arc::new(ledger),
        Arc::new(InMemoryMessageStore::new()),
        queue,
        Pricing::Configured {
            normal_minor: 100,
            priority_minor: 250,
        },
    );
    (api::router(service), rx)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    client: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(client) = client {
        request = request.header("X-Client-ID", client);
    }
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

// key: messages-api-tests -> submit,list,get
#[tokio::test]
async fn submit_returns_created_and_message_is_readable() {
    let (app, _rx) = app(1000).await;

    let (status, body) = send(
        &app,
        "POST",
        "/messages",
        Some("c1"),
        Some(json!({"to": "+15550100", "body": "hello", "type": "priority"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "CREATED");
    let id = body["id"].as_str().unwrap().to_string();

    let (status, message) = send(&app, "GET", &format!("/messages/{id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["client_id"], "c1");
    assert_eq!(message["type"], "PRIORITY");
    assert_eq!(message["price_minor"], 250);
    assert_eq!(message["to"], "+15550100");
}

#[tokio::test]
async fn submit_validation_errors() {
    let (app, _rx) = app(1000).await;

    let (status, _) = send(
        &app,
        "POST",
        "/messages",
        None,
        Some(json!({"to": "+1", "body": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let long = "x".repeat(161);
    let (status, _) = send(
        &app,
        "POST",
        "/messages",
        Some("c1"),
        Some(json!({"to": "+1", "body": long})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/messages",
        Some("c1"),
        Some(json!({"to": "+1", "body": "hi", "type": "bulk"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn insufficient_funds_is_payment_required() {
    let (app, _rx) = app(50).await;
    let (status, body) = send(
        &app,
        "POST",
        "/messages",
        Some("c1"),
        Some(json!({"to": "+1", "body": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "insufficient_funds");

    let (_, list) = send(&app, "GET", "/messages", Some("c1"), None).await;
    assert_eq!(list["count"], 0);
}

#[tokio::test]
async fn list_pages_newest_first_and_filters() {
    let (app, _rx) = app(10_000).await;
    let mut ids = Vec::new();
    for (i, kind) in ["NORMAL", "PRIORITY", "NORMAL"].iter().enumerate() {
        let (_, body) = send(
            &app,
            "POST",
            "/messages",
            Some("c1"),
            Some(json!({"to": "+1", "body": format!("m{i}"), "type": kind})),
        )
        .await;
        ids.push(body["id"].as_str().unwrap().to_string());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (status, list) = send(&app, "GET", "/messages?limit=2&page=0", Some("c1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["count"], 2);
    assert_eq!(list["limit"], 2);
    assert_eq!(list["items"][0]["id"], ids[2]);
    assert_eq!(list["items"][1]["id"], ids[1]);

    let (_, second) = send(&app, "GET", "/messages?limit=2&page=1", Some("c1"), None).await;
    assert_eq!(second["count"], 1);
    assert_eq!(second["items"][0]["id"], ids[0]);

    let (_, priority) = send(&app, "GET", "/messages?type=priority", Some("c1"), None).await;
    assert_eq!(priority["count"], 1);

    let (_, unknown) = send(
        &app,
        "GET",
        "/messages?type=bulk&status=nope&limit=abc",
        Some("c1"),
        None,
    )
    .await;
    assert_eq!(unknown["count"], 3);
    assert_eq!(unknown["limit"], 20);

    let (_, created) = send(&app, "GET", "/messages?status=CREATED", Some("c1"), None).await;
    assert_eq!(created["count"], 3);

    let (_, other) = send(&app, "GET", "/messages", Some("c2"), None).await;
    assert_eq!(other["count"], 0);
}

#[tokio::test]
async fn unknown_or_malformed_ids_are_not_found() {
    let (app, _rx) = app(1000).await;
    let (status, _) = send(&app, "GET", "/messages/not-a-uuid", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = send(
        &app,
        "GET",
        &format!("/messages/{}", uuid::Uuid::new_v4()),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}
