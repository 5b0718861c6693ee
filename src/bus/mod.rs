//! Ordered, at-least-once pub/sub seam shared by the orchestrator and the workers.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{InMemoryBus, InMemorySubscriber};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscriber closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[cfg(feature = "kafka")]
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// One keyed payload. Records sharing a key land on the same partition and keep their
/// relative order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A record as seen by a subscriber, with the position needed to commit it.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub record: Record,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, record: Record) -> Result<(), BusError>;
}

/// Single-topic consumer bound to a consumer group. Records received but never committed
/// are handed out again to the next subscriber of the same group.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn recv(&mut self) -> Result<Delivery, BusError>;

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

/// Bus backend selected at startup.
#[derive(Clone)]
pub enum Bus {
    Memory(InMemoryBus),
    #[cfg(feature = "kafka")]
    Kafka(kafka::KafkaBus),
}

impl Bus {
    pub fn name(&self) -> &'static str {
        match self {
            Bus::Memory(_) => "memory",
            #[cfg(feature = "kafka")]
            Bus::Kafka(_) => "kafka",
        }
    }

    pub fn publisher(&self) -> Arc<dyn EventPublisher> {
        match self {
            Bus::Memory(bus) => Arc::new(bus.clone()),
            #[cfg(feature = "kafka")]
            Bus::Kafka(bus) => Arc::new(bus.publisher()),
        }
    }

    pub fn subscriber(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn EventSubscriber>, BusError> {
        match self {
            Bus::Memory(bus) => Ok(Box::new(bus.subscribe(topic, group))),
            #[cfg(feature = "kafka")]
            Bus::Kafka(bus) => Ok(Box::new(bus.subscribe(topic, group)?)),
        }
    }
}
