use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{DeliveryStatus, StatusEvent};

pub const MAX_BODY_CHARS: usize = 160;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Normal,
    Priority,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Normal => "NORMAL",
            MessageKind::Priority => "PRIORITY",
        }
    }

    /// Case-insensitive, surrounding whitespace ignored.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Some(MessageKind::Normal),
            "PRIORITY" => Some(MessageKind::Priority),
            _ => None,
        }
    }
}

/// key: message-lifecycle -> status state machine
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Created,
    Queued,
    Accepted,
    Delivered,
    Failed,
    Expired,
    FailedToQueue,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Created => "CREATED",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Accepted => "ACCEPTED",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Expired => "EXPIRED",
            MessageStatus::FailedToQueue => "FAILED_TO_QUEUE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Some(MessageStatus::Created),
            "QUEUED" => Some(MessageStatus::Queued),
            "ACCEPTED" => Some(MessageStatus::Accepted),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "FAILED" => Some(MessageStatus::Failed),
            "EXPIRED" => Some(MessageStatus::Expired),
            "FAILED_TO_QUEUE" => Some(MessageStatus::FailedToQueue),
            _ => None,
        }
    }

    /// Absorbing states: no event moves a message out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered
                | MessageStatus::Failed
                | MessageStatus::Expired
                | MessageStatus::FailedToQueue
        )
    }

    /// Entering this state means the charged price is owed back to the client.
    pub fn owes_refund(&self) -> bool {
        matches!(
            self,
            MessageStatus::Failed | MessageStatus::Expired | MessageStatus::FailedToQueue
        )
    }
}

impl From<DeliveryStatus> for MessageStatus {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Accepted => MessageStatus::Accepted,
            DeliveryStatus::Delivered => MessageStatus::Delivered,
            DeliveryStatus::Failed => MessageStatus::Failed,
            DeliveryStatus::Expired => MessageStatus::Expired,
        }
    }
}

/// Refund outbox marker carried on the message row.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundState {
    None,
    Owed,
    Settled,
}

impl RefundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundState::None => "NONE",
            RefundState::Owed => "OWED",
            RefundState::Settled => "SETTLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(RefundState::None),
            "OWED" => Some(RefundState::Owed),
            "SETTLED" => Some(RefundState::Settled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub client_id: String,
    pub to: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub price_minor: i64,
    pub status: MessageStatus,
    pub operator: Option<String>,
    pub refund_state: RefundState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of feeding one status event into a message row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The row was already terminal; the event changes nothing.
    Ignored { current: MessageStatus },
    Applied {
        from: MessageStatus,
        to: MessageStatus,
        refund_owed: bool,
    },
}

impl Message {
    pub fn new(
        id: Uuid,
        client_id: String,
        to: String,
        body: String,
        kind: MessageKind,
        price_minor: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            client_id,
            to,
            body,
            kind,
            price_minor,
            status: MessageStatus::Created,
            operator: None,
            refund_state: RefundState::None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a delivery report. Terminal rows are left untouched so that duplicate or
    /// late events are harmless.
    pub fn apply_event(&mut self, event: &StatusEvent, now: DateTime<Utc>) -> Transition {
        self.transition_to(event.status.into(), Some(event.operator.as_str()), now)
    }

    /// CREATED -> QUEUED only; a row already advanced by a worker report is left alone.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != MessageStatus::Created {
            return false;
        }
        self.status = MessageStatus::Queued;
        self.updated_at = now;
        true
    }

    pub fn fail_to_queue(&mut self, now: DateTime<Utc>) -> Transition {
        if self.status != MessageStatus::Created {
            return Transition::Ignored {
                current: self.status,
            };
        }
        self.transition_to(MessageStatus::FailedToQueue, None, now)
    }

    pub fn transition_to(
        &mut self,
        next: MessageStatus,
        operator: Option<&str>,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored {
                current: self.status,
            };
        }
        let from = self.status;
        self.status = next;
        if let Some(operator) = operator.filter(|op| !op.is_empty()) {
            self.operator = Some(operator.to_string());
        }
        self.updated_at = now;
        let refund_owed = next.owes_refund();
        if refund_owed {
            self.refund_state = RefundState::Owed;
        }
        Transition::Applied {
            from,
            to: next,
            refund_owed,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub kind: Option<MessageKind>,
    pub status: Option<MessageStatus>,
}

impl MessageFilter {
    pub fn matches(&self, message: &Message) -> bool {
        self.kind.map_or(true, |kind| message.kind == kind)
            && self.status.map_or(true, |status| message.status == status)
    }
}

/// Zero-based page with a clamped size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub limit: u32,
}

impl Page {
    /// Missing or non-positive limits fall back to the default; large ones are clamped.
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        let limit = match limit {
            Some(value) if value > 0 => value.min(MAX_PAGE_LIMIT as i64) as u32,
            _ => DEFAULT_PAGE_LIMIT,
        };
        let page = match page {
            Some(value) if value > 0 => u32::try_from(value).unwrap_or(u32::MAX),
            _ => 0,
        };
        Self { page, limit }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}
