use std::sync::Arc;

use anyhow::Context;
use sms_gateway::app::connect_database;
use sms_gateway::config::{LedgerConfig, Settings};
use sms_gateway::ledger::{api, InMemoryLedgerStore, LedgerService, LedgerStore, PgLedgerStore};
use sms_gateway::{shutdown, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    telemetry::init_tracing();
    let config = LedgerConfig::from_settings(&settings)?;

    let store: Arc<dyn LedgerStore> = match &config.database.url {
        Some(url) => {
            let pool =
                connect_database(&config.database, url, sqlx::migrate!("./migrations/ledger"))
                    .await?;
            Arc::new(PgLedgerStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, balances are kept in memory");
            Arc::new(InMemoryLedgerStore::new())
        }
    };
    let ledger = LedgerService::new(store);

    if let Some(seed) = config.seed.clone() {
        let client = ledger
            .create_client(seed)
            .await
            .context("failed to seed demo client")?;
        tracing::info!(client_id = %client.client_id, "demo client seeded");
    }

    let app = telemetry::with_metrics(api::router(ledger));
    tracing::info!(addr = %config.bind_address, "Listening for incoming connections");
    axum::Server::bind(&config.bind_address)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown::os_signal())
        .await?;
    Ok(())
}
