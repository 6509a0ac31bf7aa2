use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use document_aggregator::config::{AppConfig, StoreBackend};
use document_aggregator::metrics::Metrics;
use document_aggregator::{AggregationStore, DocumentProcessor, MemoryStore, Observation, PostgresStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,document_aggregator=debug")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(backend = ?config.store.backend, "Starting document aggregator");

    // === 1. Build the configured store ===
    let store: Arc<dyn AggregationStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::with_shards(config.store.memory_shards)),
        StoreBackend::Postgres => {
            let store = PostgresStore::connect(&config.database)
                .await?
                .with_retry(config.retry_config());
            store.migrate().await?;
            tracing::info!("Migrations applied");
            Arc::new(store)
        }
    };

    // === 2. Wire the processor ===
    let metrics = Arc::new(Metrics::new()?);
    let processor = DocumentProcessor::new(store, metrics.clone(), config.store.operation_timeout());

    // === 3. Replay out-of-order fetches of one document ===
    let url = "https://example.com/article";
    let fetches = [
        Observation::new(url, 100, 100, "T1"),
        Observation::new(url, 200, 200, "T2"),
        Observation::new(url, 50, 50, "Old"),
        Observation::new(url, 150, 150, "Mid"),
        Observation::new(url, 200, 200, "Dup"),
    ];

    for obs in &fetches {
        match processor.process(obs).await? {
            Some(doc) => tracing::info!(
                fetch_time = obs.fetch_time,
                aggregate = %serde_json::to_string(&doc)?,
                "Forwarding aggregate downstream"
            ),
            None => tracing::info!(fetch_time = obs.fetch_time, "Nothing to forward"),
        }
    }

    if let Some(doc) = processor.get(url).await? {
        tracing::info!(aggregate = %serde_json::to_string(&doc)?, "Final aggregate");
    }

    tracing::info!(
        metric_families = metrics.registry().gather().len(),
        "Done"
    );

    Ok(())
}
