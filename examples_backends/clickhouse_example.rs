use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, info_span};

use tracing_log_fanout::backend::{Consistency, RetryPolicy};
use tracing_log_fanout::clickhouse::{ClickHouseBackend, ClickHouseConfig};
use tracing_log_fanout::init::{init_tracing_with_config, LayerConfig};
use tracing_log_fanout::store::{BatchStore, InsertStatement};

/// Expects a table like:
///
/// ```sql
/// CREATE TABLE log_storage.logs (
///   timestamp  DateTime64(3),
///   level      LowCardinality(String),
///   message    String,
///   attributes Map(String, String)
/// ) ENGINE = MergeTree ORDER BY timestamp;
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let backend = ClickHouseBackend::connect(ClickHouseConfig {
        url: "http://127.0.0.1:8123".to_string(),
        database: "log_storage".to_string(),
        user: Some("default".to_string()),
        password: None,
        consistency: Consistency::Quorum,
        timeout: Duration::from_secs(5),
        retry: RetryPolicy::default(),
    })?;

    if let Err(e) = backend.validate_schema(&InsertStatement::logs()).await {
        eprintln!("schema check failed: {}", e);
    }

    let config = LayerConfig {
        batch_size: 10,
        flush_interval: Duration::from_secs(10),
        ..LayerConfig::default()
    };
    let store = BatchStore::new(Arc::new(backend), config.store_options())?;
    init_tracing_with_config(&store, &config)?;

    info!("starting service");

    let span = info_span!("auth");
    let _enter = span.enter();
    error!(user_id = 42, reason = "invalid password", "authentication failed");

    store.close().await?;
    Ok(())
}
