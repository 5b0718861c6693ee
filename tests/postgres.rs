use std::sync::Arc;

use chrono::Utc;
use sms_gateway::events::{DeliveryStatus, StatusEvent};
use sms_gateway::ledger::{LedgerError, LedgerService, NewClient, PgLedgerStore};
use sms_gateway::messages::{
    Message, MessageFilter, MessageKind, MessageStatus, MessageStore, Page, PgMessageStore,
    RefundState, StatusOutcome,
};
use sqlx::PgPool;
use uuid::Uuid;

fn status(message_id: Uuid, status: DeliveryStatus) -> StatusEvent {
    StatusEvent {
        message_id,
        status,
        operator: "mock".into(),
        at: Utc::now(),
        trace_id: String::new(),
        worker: "w1".into(),
    }
}

// key: postgres-tests -> row-locked debits,refund outbox
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn ledger_debits_refunds_and_replays(pool: PgPool) {
    sqlx::migrate!("./migrations/ledger").run(&pool).await.unwrap();
    let ledger = LedgerService::new(Arc::new(PgLedgerStore::new(pool.clone())));

    ledger
        .create_client(NewClient {
            client_id: "c1".into(),
            initial_balance_minor: 300,
            normal_price_minor: 100,
            priority_price_minor: 250,
        })
        .await
        .unwrap();

    assert_eq!(ledger.debit("c1", 250, "message:a:debit").await.unwrap(), 50);
    let overdraft = ledger.debit("c1", 100, "message:b:debit").await;
    assert!(matches!(
        overdraft,
        Err(LedgerError::InsufficientFunds {
            balance: 50,
            requested: 100
        })
    ));

    assert_eq!(ledger.refund("c1", 250, "message:a:refund").await.unwrap(), 300);
    assert_eq!(ledger.refund("c1", 250, "message:a:refund").await.unwrap(), 300);

    let journal = ledger.transactions("c1", Some(10)).await.unwrap();
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[0].amount_minor, 250);
    assert_eq!(journal[1].amount_minor, -250);

    assert!(matches!(
        ledger.debit("ghost", 1, "").await,
        Err(LedgerError::NotFound(_))
    ));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_debits_never_overdraw(pool: PgPool) {
    sqlx::migrate!("./migrations/ledger").run(&pool).await.unwrap();
    let ledger = LedgerService::new(Arc::new(PgLedgerStore::new(pool.clone())));
    ledger
        .create_client(NewClient {
            client_id: "c1".into(),
            initial_balance_minor: 500,
            normal_price_minor: 100,
            priority_price_minor: 250,
        })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.debit("c1", 100, &format!("message:{i}:debit")).await.is_ok()
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 5);
    assert_eq!(ledger.get_client("c1").await.unwrap().balance_minor, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn message_rows_follow_the_lifecycle(pool: PgPool) {
    sqlx::migrate!("./migrations/messages").run(&pool).await.unwrap();
    let store = PgMessageStore::new(pool.clone());

    let delivered = Message::new(
        Uuid::new_v4(),
        "c1".into(),
        "+15550100".into(),
        "hello".into(),
        MessageKind::Priority,
        250,
        Utc::now(),
    );
    let failed = Message::new(
        Uuid::new_v4(),
        "c1".into(),
        "+15550101".into(),
        "bye".into(),
        MessageKind::Normal,
        100,
        Utc::now() + chrono::Duration::milliseconds(5),
    );
    store.insert(&delivered).await.unwrap();
    store.insert(&failed).await.unwrap();
    assert!(store.insert(&failed).await.is_err());

    let stored = store.get(delivered.id).await.unwrap().unwrap();
    assert_eq!(stored.to, "+15550100");
    assert_eq!(stored.kind, MessageKind::Priority);

    assert!(store.mark_queued(delivered.id).await.unwrap());
    assert!(!store.mark_queued(delivered.id).await.unwrap());
    assert!(store.mark_queued(failed.id).await.unwrap());

    let listed = store
        .list("c1", &MessageFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, failed.id);

    let priority = store
        .list(
            "c1",
            &MessageFilter {
                kind: Some(MessageKind::Priority),
                status: None,
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(priority.len(), 1);

    let outcome = store
        .apply_status(&status(delivered.id, DeliveryStatus::Delivered))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StatusOutcome::Applied {
            refund_owed: false,
            ..
        }
    ));
    let late = store
        .apply_status(&status(delivered.id, DeliveryStatus::Accepted))
        .await
        .unwrap();
    assert!(matches!(
        late,
        StatusOutcome::Ignored {
            current: MessageStatus::Delivered
        }
    ));

    let outcome = store
        .apply_status(&status(failed.id, DeliveryStatus::Failed))
        .await
        .unwrap();
    match outcome {
        StatusOutcome::Applied {
            message,
            refund_owed,
        } => {
            assert!(refund_owed);
            assert_eq!(message.refund_state, RefundState::Owed);
            assert_eq!(message.operator.as_deref(), Some("mock"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let owed = store.refunds_owed(10).await.unwrap();
    assert_eq!(owed.len(), 1);
    assert_eq!(owed[0].id, failed.id);
    assert!(store.settle_refund(failed.id).await.unwrap());
    assert!(!store.settle_refund(failed.id).await.unwrap());
    assert!(store.refunds_owed(10).await.unwrap().is_empty());

    let missing = store
        .apply_status(&status(Uuid::new_v4(), DeliveryStatus::Failed))
        .await
        .unwrap();
    assert!(matches!(missing, StatusOutcome::Missing));
}
