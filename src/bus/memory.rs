use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use super::{BusError, Delivery, EventPublisher, EventSubscriber, Record};

pub const DEFAULT_PARTITIONS: u32 = 4;

/// In-process partitioned log with consumer-group offsets.
///
/// Topics are created on first use. Each partition is an append-only vector; committed
/// offsets are tracked per (group, topic, partition) and a fresh subscriber resumes from
/// them, so anything received but not committed is delivered again.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: u32,
    topics: DashMap<String, Arc<Topic>>,
    committed: DashMap<(String, String, u32), u64>,
}

struct Topic {
    name: String,
    logs: Vec<Mutex<Vec<Record>>>,
    published: watch::Sender<u64>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

impl InMemoryBus {
    pub fn new(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                topics: DashMap::new(),
                committed: DashMap::new(),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (published, _) = watch::channel(0);
                Arc::new(Topic {
                    name: name.to_string(),
                    logs: (0..self.inner.partitions)
                        .map(|_| Mutex::new(Vec::new()))
                        .collect(),
                    published,
                })
            })
            .clone()
    }

    /// Subscribes to every partition of `topic`.
    pub fn subscribe(&self, topic: &str, group: &str) -> InMemorySubscriber {
        self.subscribe_assigned(topic, group, 0, 1)
    }

    /// Subscribes as `member` of `members` consumers sharing a group; partitions are dealt
    /// round-robin.
    pub fn subscribe_assigned(
        &self,
        topic: &str,
        group: &str,
        member: u32,
        members: u32,
    ) -> InMemorySubscriber {
        let topic = self.topic(topic);
        let members = members.max(1);
        let assigned: Vec<u32> = (0..self.inner.partitions)
            .filter(|p| p % members == member % members)
            .collect();
        let cursors = assigned
            .iter()
            .map(|&p| {
                let committed = self
                    .inner
                    .committed
                    .get(&(group.to_string(), topic.name.clone(), p))
                    .map(|entry| *entry)
                    .unwrap_or(0);
                (p, committed)
            })
            .collect();
        InMemorySubscriber {
            inner: self.inner.clone(),
            published: topic.published.subscribe(),
            topic,
            group: group.to_string(),
            assigned,
            cursors,
            next: 0,
        }
    }

    /// Every record currently stored for `topic`, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let Some(topic) = self.inner.topics.get(topic).map(|t| t.clone()) else {
            return Vec::new();
        };
        topic
            .logs
            .iter()
            .flat_map(|log| match log.lock() {
                Ok(log) => log.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            })
            .collect()
    }

    pub fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> Option<u64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|entry| *entry)
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(&self, topic: &str, record: Record) -> Result<(), BusError> {
        let topic = self.topic(topic);
        let partition = partition_for(&record.key, self.inner.partitions);
        {
            let mut log = topic.logs[partition as usize]
                .lock()
                .map_err(|_| BusError::Transport("partition log poisoned".into()))?;
            log.push(record);
        }
        topic.published.send_modify(|count| *count += 1);
        Ok(())
    }
}

pub struct InMemorySubscriber {
    inner: Arc<Inner>,
    topic: Arc<Topic>,
    published: watch::Receiver<u64>,
    group: String,
    assigned: Vec<u32>,
    cursors: HashMap<u32, u64>,
    next: usize,
}

impl InMemorySubscriber {
    pub fn assigned_partitions(&self) -> &[u32] {
        &self.assigned
    }

    fn poll(&mut self) -> Result<Option<Delivery>, BusError> {
        for step in 0..self.assigned.len() {
            let slot = (self.next + step) % self.assigned.len();
            let partition = self.assigned[slot];
            let cursor = self.cursors.get(&partition).copied().unwrap_or(0);
            let record = {
                let log = self.topic.logs[partition as usize]
                    .lock()
                    .map_err(|_| BusError::Transport("partition log poisoned".into()))?;
                log.get(cursor as usize).cloned()
            };
            if let Some(record) = record {
                self.cursors.insert(partition, cursor + 1);
                self.next = (slot + 1) % self.assigned.len();
                return Ok(Some(Delivery {
                    topic: self.topic.name.clone(),
                    partition,
                    offset: cursor,
                    record,
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl EventSubscriber for InMemorySubscriber {
    async fn recv(&mut self) -> Result<Delivery, BusError> {
        if self.assigned.is_empty() {
            std::future::pending::<()>().await;
        }
        loop {
            self.published.borrow_and_update();
            if let Some(delivery) = self.poll()? {
                return Ok(delivery);
            }
            self.published
                .changed()
                .await
                .map_err(|_| BusError::Closed)?;
        }
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let next = delivery.offset + 1;
        self.inner
            .committed
            .entry((self.group.clone(), delivery.topic.clone(), delivery.partition))
            .and_modify(|offset| *offset = (*offset).max(next))
            .or_insert(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(key: &str, body: &str) -> Record {
        Record::new(key, body.as_bytes().to_vec())
    }

    async fn recv(sub: &mut InMemorySubscriber) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("record should arrive")
            .unwrap()
    }

    #[tokio::test]
    async fn same_key_keeps_publish_order() {
        let bus = InMemoryBus::new(8);
        for i in 0..20 {
            bus.publish("t", record("c1", &i.to_string())).await.unwrap();
        }
        let mut sub = bus.subscribe("t", "g");
        for i in 0..20 {
            let delivery = recv(&mut sub).await;
            assert_eq!(delivery.record.payload, i.to_string().into_bytes());
            assert_eq!(delivery.offset, i as u64);
        }
    }

    #[tokio::test]
    async fn recv_wakes_on_later_publish() {
        let bus = InMemoryBus::default();
        let mut sub = bus.subscribe("t", "g");
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", record("k", "late")).await.unwrap();
        });
        let delivery = recv(&mut sub).await;
        assert_eq!(delivery.record.payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered_to_the_group() {
        let bus = InMemoryBus::new(1);
        bus.publish("t", record("k", "a")).await.unwrap();
        bus.publish("t", record("k", "b")).await.unwrap();

        let mut first = bus.subscribe("t", "g");
        let a = recv(&mut first).await;
        first.commit(&a).await.unwrap();
        let b = recv(&mut first).await;
        assert_eq!(b.record.payload, b"b".to_vec());
        drop(first);

        let mut second = bus.subscribe("t", "g");
        let again = recv(&mut second).await;
        assert_eq!(again.record.payload, b"b".to_vec());
        assert_eq!(bus.committed_offset("t", "g", 0), Some(1));
    }

    #[tokio::test]
    async fn groups_track_offsets_independently() {
        let bus = InMemoryBus::new(1);
        bus.publish("t", record("k", "a")).await.unwrap();
        let mut one = bus.subscribe("t", "g1");
        let delivery = recv(&mut one).await;
        one.commit(&delivery).await.unwrap();

        let mut other = bus.subscribe("t", "g2");
        assert_eq!(recv(&mut other).await.record.payload, b"a".to_vec());
    }

    #[test]
    fn members_split_partitions() {
        let bus = InMemoryBus::new(4);
        let a = bus.subscribe_assigned("t", "g", 0, 2);
        let b = bus.subscribe_assigned("t", "g", 1, 2);
        assert_eq!(a.assigned_partitions(), &[0, 2]);
        assert_eq!(b.assigned_partitions(), &[1, 3]);
    }

    #[test]
    fn partitioning_is_stable() {
        assert_eq!(partition_for("client-7", 16), partition_for("client-7", 16));
        assert_eq!(partition_for("anything", 1), 0);
    }
}
