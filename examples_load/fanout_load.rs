use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::error;

use tracing_log_fanout::init::{init_tracing_with_config, LayerConfig};
use tracing_log_fanout::memory::MemoryBackend;
use tracing_log_fanout::store::BatchStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let backend = MemoryBackend::new();

    let layer_config = LayerConfig {
        batch_size: 1_000,
        flush_interval: Duration::from_millis(200),
        enable_stdout: false,
        ..LayerConfig::default()
    };

    let store = BatchStore::new(Arc::new(backend.clone()), layer_config.store_options())?;
    init_tracing_with_config(&store, &layer_config)?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "fan-out load test error");
    }

    let elapsed = start.elapsed();
    println!("fan-out: logged {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    store.close().await?;
    println!("persisted {} rows in {} batches", backend.entries().len(), backend.batches().len());
    Ok(())
}
