//! Wiring shared by the binaries and the integration tests.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::bus::{Bus, InMemoryBus};
use crate::config::{BusConfig, DatabaseConfig, OrchestratorConfig};
use crate::ledger::{LedgerClient, LedgerService};
use crate::messages::{
    publish_queue, spawn_publisher, spawn_refund_sweeper, spawn_status_consumer, MessageService,
    MessageStore,
};
use crate::shutdown::Shutdown;
use crate::worker::DeliveryWorker;

pub const WORKER_GROUP: &str = "sms-workers";

pub async fn connect_database(
    config: &DatabaseConfig,
    url: &str,
    mut migrator: sqlx::migrate::Migrator,
) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .context("failed to connect to database")?;
    // The ledger and the orchestrator may share one database.
    migrator.set_ignore_missing(true);
    if let Err(error) = migrator.run(&pool).await {
        if config.allow_migration_failure {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("database migrations failed");
        }
    }
    Ok(pool)
}

pub fn connect_bus(config: &BusConfig) -> anyhow::Result<Bus> {
    match config {
        BusConfig::Memory { partitions } => Ok(Bus::Memory(InMemoryBus::new(*partitions))),
        #[cfg(feature = "kafka")]
        BusConfig::Kafka { brokers } => Ok(Bus::Kafka(crate::bus::kafka::KafkaBus::connect(
            brokers,
        )?)),
        #[cfg(not(feature = "kafka"))]
        BusConfig::Kafka { .. } => {
            anyhow::bail!("BUS_BACKEND=kafka requires building with the `kafka` feature")
        }
    }
}

/// A running orchestrator: the HTTP service plus its background loops.
pub struct Orchestrator {
    pub service: MessageService,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn router(&self) -> Router {
        crate::messages::api::router(self.service.clone())
    }

    /// Waits for every background loop to stop. Trigger shutdown first.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(?err, "background task ended abnormally");
            }
        }
    }
}

/// Starts the publish drainer, the status consumer, the refund sweeper and, on the
/// in-memory bus, the embedded delivery workers.
pub fn start_orchestrator(
    config: &OrchestratorConfig,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn MessageStore>,
    bus: &Bus,
    shutdown: Shutdown,
) -> anyhow::Result<Orchestrator> {
    let (queue, rx) = publish_queue(config.queue_capacity, config.enqueue_timeout);
    let service = MessageService::new(ledger, store.clone(), queue, config.pricing.clone());
    let compensator = service.compensator();

    let mut tasks = vec![
        spawn_publisher(
            rx,
            bus.publisher(),
            config.topics.clone(),
            store.clone(),
            compensator.clone(),
            shutdown.clone(),
        ),
        spawn_status_consumer(
            bus.subscriber(&config.status_topic, &config.status_group)?,
            store,
            compensator.clone(),
            shutdown.clone(),
        ),
    ];
    if let Some(sweeper) =
        spawn_refund_sweeper(compensator, config.refund_retry_interval, shutdown.clone())
    {
        tasks.push(sweeper);
    }

    match bus {
        Bus::Memory(memory) => {
            let members = config.embedded_workers;
            for topic in [&config.topics.normal, &config.topics.priority] {
                for member in 0..members {
                    let name = format!("{}-{}-{}", config.worker.worker_name, topic, member);
                    let worker = DeliveryWorker::new(
                        config.worker.settings(name),
                        Box::new(memory.subscribe_assigned(topic, WORKER_GROUP, member, members)),
                        bus.publisher(),
                    );
                    tasks.push(worker.spawn(shutdown.clone()));
                }
            }
            tracing::info!(workers = members * 2, "embedded delivery workers started");
        }
        #[cfg(feature = "kafka")]
        Bus::Kafka(_) => {}
    }

    tracing::info!(bus = bus.name(), "orchestrator pipeline started");
    Ok(Orchestrator { service, tasks })
}

/// In-process ledger over the in-memory store, seeded when a demo client is configured.
pub async fn embedded_ledger(
    seed: Option<crate::ledger::NewClient>,
) -> anyhow::Result<LedgerService> {
    let ledger = LedgerService::new(Arc::new(crate::ledger::InMemoryLedgerStore::new()));
    if let Some(seed) = seed {
        ledger
            .create_client(seed)
            .await
            .context("failed to seed demo client")?;
    }
    Ok(ledger)
}
