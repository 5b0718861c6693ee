use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};

use super::{BusError, Delivery, EventPublisher, EventSubscriber, Record};

/// Kafka-compatible broker (Kafka, Redpanda) reached through librdkafka.
#[derive(Clone)]
pub struct KafkaBus {
    brokers: String,
    producer: FutureProducer,
}

impl KafkaBus {
    pub fn connect(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()?;
        Ok(Self {
            brokers: brokers.to_string(),
            producer,
        })
    }

    pub fn publisher(&self) -> KafkaPublisher {
        KafkaPublisher {
            producer: self.producer.clone(),
        }
    }

    pub fn subscribe(&self, topic: &str, group: &str) -> Result<KafkaSubscriber, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .create()?;
        consumer.subscribe(&[topic])?;
        tracing::info!(%topic, %group, brokers = %self.brokers, "kafka consumer subscribed");
        Ok(KafkaSubscriber { consumer })
    }
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, record: Record) -> Result<(), BusError> {
        let headers = record
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_str()),
                })
            });
        let message = FutureRecord::to(topic)
            .key(&record.key)
            .payload(&record.payload)
            .headers(headers);
        self.producer
            .send(message, Duration::from_secs(5))
            .await
            .map_err(|(err, _)| BusError::Kafka(err))?;
        Ok(())
    }
}

pub struct KafkaSubscriber {
    consumer: StreamConsumer,
}

#[async_trait]
impl EventSubscriber for KafkaSubscriber {
    async fn recv(&mut self) -> Result<Delivery, BusError> {
        let message = self.consumer.recv().await?;
        let mut record = Record::new(
            message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned())
                .unwrap_or_default(),
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        );
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                if let Some(value) = header.value {
                    record
                        .headers
                        .insert(header.key.to_string(), String::from_utf8_lossy(value).into_owned());
                }
            }
        }
        Ok(Delivery {
            topic: message.topic().to_string(),
            partition: u32::try_from(message.partition()).unwrap_or_default(),
            offset: u64::try_from(message.offset()).unwrap_or_default(),
            record,
        })
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &delivery.topic,
            delivery.partition as i32,
            Offset::Offset(delivery.offset as i64 + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
