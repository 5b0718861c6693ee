use std::sync::Arc;

use sms_gateway::app::{connect_bus, connect_database, embedded_ledger, start_orchestrator};
use sms_gateway::config::{LedgerTarget, OrchestratorConfig, Settings};
use sms_gateway::ledger::{HttpLedgerClient, LedgerClient};
use sms_gateway::messages::{InMemoryMessageStore, MessageStore, PgMessageStore};
use sms_gateway::{shutdown, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    telemetry::init_tracing();
    let config = OrchestratorConfig::from_settings(&settings)?;

    let store: Arc<dyn MessageStore> = match &config.database.url {
        Some(url) => {
            let pool =
                connect_database(&config.database, url, sqlx::migrate!("./migrations/messages"))
                    .await?;
            Arc::new(PgMessageStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, messages are kept in memory");
            Arc::new(InMemoryMessageStore::new())
        }
    };

    let ledger: Arc<dyn LedgerClient> = match &config.ledger {
        LedgerTarget::Remote { url, timeout } => Arc::new(HttpLedgerClient::new(url, *timeout)?),
        LedgerTarget::Embedded { seed } => {
            tracing::warn!("LEDGER_URL not set, using an embedded in-memory ledger");
            Arc::new(embedded_ledger(seed.clone()).await?)
        }
    };

    let bus = connect_bus(&config.bus)?;
    let (trigger, shutdown) = shutdown::channel();
    let orchestrator = start_orchestrator(&config, ledger, store, &bus, shutdown)?;
    let app = telemetry::with_metrics(orchestrator.router());

    tracing::info!(addr = %config.bind_address, "Listening for incoming connections");
    axum::Server::bind(&config.bind_address)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown::os_signal())
        .await?;

    trigger.trigger();
    orchestrator.join().await;
    tracing::info!("orchestrator stopped");
    Ok(())
}
