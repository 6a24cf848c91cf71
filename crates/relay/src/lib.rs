//! Outbox relay daemon wiring.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use eventide_events::{EventEnvelope, EventPublisherPort, PublishError};
use eventide_infra::PipelineConfig;
use eventide_infra::db;
use eventide_infra::outbox::{InMemoryOutboxStore, OutboxRelay, OutboxStore, PostgresOutboxStore};

/// Publisher sink that writes each envelope to the log.
///
/// Stands in for a broker client: the relay's delivery guarantees are the
/// same whatever the sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisherPort for TracingPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let body = serde_json::to_string(envelope)
            .map_err(|e| PublishError::transport(format!("envelope encoding: {e}")))?;
        info!(
            event_id = %envelope.event_id(),
            event_type = envelope.event_type(),
            stream_id = %envelope.aggregate_id(),
            version = envelope.aggregate_version(),
            envelope = %body,
            "event published"
        );
        Ok(())
    }
}

/// Pick the outbox backend: Postgres (migrated) when persistent stores are
/// enabled, in-memory otherwise.
pub async fn outbox_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn OutboxStore>> {
    match (config.use_persistent_stores, config.database_url.as_deref()) {
        (true, Some(url)) => {
            let pool = PgPool::connect(url).await?;
            db::migrate(&pool).await?;
            info!("using postgres outbox");
            Ok(Arc::new(PostgresOutboxStore::new(pool)))
        }
        (true, None) => anyhow::bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true"),
        (false, _) => {
            info!("using in-memory outbox");
            Ok(InMemoryOutboxStore::arc())
        }
    }
}

pub fn build_relay(
    config: &PipelineConfig,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisherPort>,
) -> OutboxRelay {
    OutboxRelay::new(store, publisher, config.relay_config())
}
