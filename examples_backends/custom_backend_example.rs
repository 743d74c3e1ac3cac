use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use tracing_log_fanout::{
    init::init_tracing,
    store::{BatchStore, BoxError, Entry, StoreBackend, StoreOptions},
};

/// Example of integrating a completely custom backend by implementing
/// the `StoreBackend` trait directly. Imagine this talks to some
/// proprietary DB for which this crate does not provide a built-in
/// backend.
struct MyCustomDbBackend;

#[async_trait]
impl StoreBackend for MyCustomDbBackend {
    async fn execute_batch(&self, entries: &[Entry]) -> Result<(), BoxError> {
        // Here you would call your own client library for the target DB.
        // For the sake of example we just print the batch.
        for entry in entries {
            println!("[my-custom-db] {} {:?}", entry.statement, entry.values);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = BatchStore::new(Arc::new(MyCustomDbBackend), StoreOptions::default())?;
    init_tracing(&store)?;

    info!("custom backend example started");
    error!(db = "my-custom-db", "simulated error sent via custom backend");

    store.close().await?;
    Ok(())
}
