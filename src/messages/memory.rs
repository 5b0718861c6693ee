use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::models::{Message, MessageFilter, Page, RefundState, Transition};
use super::store::{MessageStore, StatusOutcome};
use crate::events::StatusEvent;

/// Message store kept in process memory. The DashMap shard lock plays the role of the
/// row lock: each transition runs entirely under `get_mut`.
#[derive(Default)]
pub struct InMemoryMessageStore {
    rows: DashMap<Uuid, Row>,
    seq: AtomicU64,
}

struct Row {
    seq: u64,
    message: Message,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn transition(&self, id: Uuid, apply: impl FnOnce(&mut Message) -> Transition) -> StatusOutcome {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return StatusOutcome::Missing;
        };
        match apply(&mut row.message) {
            Transition::Ignored { current } => StatusOutcome::Ignored { current },
            Transition::Applied { refund_owed, .. } => StatusOutcome::Applied {
                message: row.message.clone(),
                refund_owed,
            },
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: &Message) -> sqlx::Result<()> {
        match self.rows.entry(message.id) {
            Entry::Occupied(_) => Err(sqlx::Error::Protocol(format!(
                "duplicate message id {}",
                message.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Row {
                    seq: self.seq.fetch_add(1, Ordering::SeqCst),
                    message: message.clone(),
                });
                Ok(())
            }
        }
    }

    async fn get(&self, id: Uuid) -> sqlx::Result<Option<Message>> {
        Ok(self.rows.get(&id).map(|row| row.message.clone()))
    }

    async fn list(
        &self,
        client_id: &str,
        filter: &MessageFilter,
        page: Page,
    ) -> sqlx::Result<Vec<Message>> {
        let mut matching: Vec<(u64, Message)> = self
            .rows
            .iter()
            .filter(|row| row.message.client_id == client_id && filter.matches(&row.message))
            .map(|row| (row.seq, row.message.clone()))
            .collect();
        matching.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b_seq.cmp(a_seq))
        });
        Ok(matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .map(|(_, message)| message)
            .collect())
    }

    async fn mark_queued(&self, id: Uuid) -> sqlx::Result<bool> {
        Ok(self
            .rows
            .get_mut(&id)
            .map(|mut row| row.message.mark_queued(Utc::now()))
            .unwrap_or(false))
    }

    async fn mark_failed_to_queue(&self, id: Uuid) -> sqlx::Result<StatusOutcome> {
        Ok(self.transition(id, |message| message.fail_to_queue(Utc::now())))
    }

    async fn apply_status(&self, event: &StatusEvent) -> sqlx::Result<StatusOutcome> {
        Ok(self.transition(event.message_id, |message| {
            message.apply_event(event, Utc::now())
        }))
    }

    async fn refunds_owed(&self, limit: i64) -> sqlx::Result<Vec<Message>> {
        let mut owed: Vec<Message> = self
            .rows
            .iter()
            .filter(|row| row.message.refund_state == RefundState::Owed)
            .map(|row| row.message.clone())
            .collect();
        owed.sort_by_key(|message| message.updated_at);
        owed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(owed)
    }

    async fn settle_refund(&self, id: Uuid) -> sqlx::Result<bool> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.message.refund_state != RefundState::Owed {
            return Ok(false);
        }
        row.message.refund_state = RefundState::Settled;
        row.message.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeliveryStatus;
    use crate::messages::models::{MessageKind, MessageStatus};
    use chrono::Duration;

    fn message(client: &str, kind: MessageKind, minutes_ago: i64) -> Message {
        Message::new(
            Uuid::new_v4(),
            client.into(),
            "+15550100".into(),
            "hello".into(),
            kind,
            10,
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }

    fn event(id: Uuid, status: DeliveryStatus) -> StatusEvent {
        StatusEvent {
            message_id: id,
            status,
            operator: "mock".into(),
            at: Utc::now(),
            trace_id: "t".into(),
            worker: "w1".into(),
        }
    }

    #[tokio::test]
    async fn list_is_newest_first_and_scoped_to_client() {
        let store = InMemoryMessageStore::new();
        let old = message("c1", MessageKind::Normal, 10);
        let new = message("c1", MessageKind::Priority, 1);
        let other = message("c2", MessageKind::Normal, 0);
        for m in [&old, &new, &other] {
            store.insert(m).await.unwrap();
        }

        let all = store
            .list("c1", &MessageFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), vec![new.id, old.id]);

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
        assert_eq!(priority[0].id, new.id);

        let second_page = store
            .list("c1", &MessageFilter::default(), Page::new(Some(1), Some(1)))
            .await
            .unwrap();
        assert_eq!(second_page[0].id, old.id);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryMessageStore::new();
        let m = message("c1", MessageKind::Normal, 0);
        store.insert(&m).await.unwrap();
        assert!(store.insert(&m).await.is_err());
    }

    #[tokio::test]
    async fn failure_marks_refund_owed_until_settled() {
        let store = InMemoryMessageStore::new();
        let m = message("c1", MessageKind::Normal, 0);
        store.insert(&m).await.unwrap();
        assert!(store.mark_queued(m.id).await.unwrap());

        let outcome = store
            .apply_status(&event(m.id, DeliveryStatus::Failed))
            .await
            .unwrap();
        assert!(matches!(outcome, StatusOutcome::Applied { refund_owed: true, .. }));
        assert_eq!(store.refunds_owed(10).await.unwrap().len(), 1);

        assert!(store.settle_refund(m.id).await.unwrap());
        assert!(!store.settle_refund(m.id).await.unwrap());
        assert!(store.refunds_owed(10).await.unwrap().is_empty());

        let again = store
            .apply_status(&event(m.id, DeliveryStatus::Failed))
            .await
            .unwrap();
        assert_eq!(
            again,
            StatusOutcome::Ignored {
                current: MessageStatus::Failed
            }
        );
    }

    #[tokio::test]
    async fn unknown_message_is_missing() {
        let store = InMemoryMessageStore::new();
        let outcome = store
            .apply_status(&event(Uuid::new_v4(), DeliveryStatus::Delivered))
            .await
            .unwrap();
        assert_eq!(outcome, StatusOutcome::Missing);
        assert!(!store.mark_queued(Uuid::new_v4()).await.unwrap());
    }
}
