//! Message orchestrator: submission, the publish pipeline, status tracking and refunds.

pub mod api;
pub mod memory;
pub mod models;
pub mod publisher;
pub mod saga;
pub mod service;
pub mod status;
pub mod store;

pub use memory::InMemoryMessageStore;
pub use models::{Message, MessageFilter, MessageKind, MessageStatus, Page, RefundState};
pub use publisher::{publish_queue, spawn_publisher, PublishQueue, PublishTopics, QueueError};
pub use saga::{spawn_refund_sweeper, Compensator, SagaStep};
pub use service::{MessageService, Pricing, SubmitMessage};
pub use status::spawn_status_consumer;
pub use store::{MessageStore, PgMessageStore, StatusOutcome};
