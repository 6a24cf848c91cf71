use std::sync::Arc;

use tracing::info;

use eventide_infra::PipelineConfig;
use eventide_relay::{TracingPublisher, build_relay, outbox_store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventide_observability::init();

    let config = PipelineConfig::from_env()?;
    let store = outbox_store(&config).await?;
    let relay = build_relay(&config, store, Arc::new(TracingPublisher));

    relay.start();
    info!("relay running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    relay.shutdown().await;

    let metrics = relay.metrics().snapshot();
    info!(
        published = metrics.published,
        failed = metrics.failed,
        skipped = metrics.skipped,
        "relay stopped"
    );
    Ok(())
}
