use sms_gateway::config::{Settings, WorkerProcessConfig};
use sms_gateway::telemetry;

#[cfg(feature = "kafka")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use sms_gateway::bus::kafka::KafkaBus;
    use sms_gateway::shutdown;
    use sms_gateway::worker::DeliveryWorker;

    let settings = Settings::load()?;
    telemetry::init_tracing();
    let config = WorkerProcessConfig::from_settings(&settings)?;

    let bus = KafkaBus::connect(&config.brokers)?;
    let worker = DeliveryWorker::new(
        config.worker.settings(config.worker.worker_name.clone()),
        Box::new(bus.subscribe(&config.topic, &config.group)?),
        Arc::new(bus.publisher()),
    );
    tracing::info!(topic = %config.topic, group = %config.group, "delivery worker starting");

    let (trigger, shutdown) = shutdown::channel();
    let handle = worker.spawn(shutdown);
    shutdown::os_signal().await;
    trigger.trigger();
    handle.await?;
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    telemetry::init_tracing();
    WorkerProcessConfig::from_settings(&settings)?;
    anyhow::bail!("delivery_worker needs a broker; rebuild with `--features kafka`")
}
