use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Error type used at the backend seam.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Durable destination that executes whole batches of [`Entry`]s.
///
/// Implementations talk to the actual database (ClickHouse, an in-memory
/// recorder, ...). [`BatchStore`] only ever calls `execute_batch` from its
/// flush routine, one batch at a time, in insertion order.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Execute every entry of `entries`.
    ///
    /// A batch may mix statements for several tables. Backends that write
    /// each table separately do not make such a batch atomic: an error may
    /// leave earlier tables written and later ones not. The store never
    /// retries a failed batch, but a backend that retries internally after
    /// a timeout can duplicate rows the server had already accepted.
    ///
    /// **Returns**
    /// - `Ok(())` if the backend accepted the batch.
    /// - `Err(..)` on timeout, connection loss or write rejection. The store
    ///   logs the failure and drops the batch.
    async fn execute_batch(&self, entries: &[Entry]) -> Result<(), BoxError>;

    /// Release the underlying connection. Default implementation is a no-op.
    async fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Parametrized insert: a target table and its ordered column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
}

impl InsertStatement {
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        InsertStatement {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// The fixed-shape statement the persister writes log rows with.
    pub fn logs() -> Self {
        InsertStatement::new("logs", ["timestamp", "level", "message", "attributes"])
    }

    /// Template with positional `?` placeholders, one per column.
    pub fn query(&self) -> String {
        let placeholders = vec!["?"; self.columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            self.columns.join(", "),
            placeholders
        )
    }
}

impl fmt::Display for InsertStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query())
    }
}

/// Positional value bound to one column of an [`InsertStatement`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    Timestamp(DateTime<Utc>),
    Text(String),
    Int(i64),
    Map(BTreeMap<String, String>),
}

/// One pending row: statement plus its positional values.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub statement: Arc<InsertStatement>,
    pub values: Vec<QueryValue>,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,

    #[error("statement `{table}` expects {expected} values, got {got}")]
    Arity {
        table: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("no Tokio runtime available to run the batch worker")]
    NoRuntime,

    #[error("backend error: {0}")]
    Backend(BoxError),
}

/// Flush thresholds for a [`BatchStore`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Pending entry count that triggers a flush.
    pub batch_size: usize,
    /// Maximum time between flushes while entries are pending.
    pub flush_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            batch_size: 5,
            flush_interval: Duration::from_secs(1),
        }
    }
}

struct Shared {
    backend: Arc<dyn StoreBackend>,
    batch_size: usize,
    batch: Mutex<Vec<Entry>>,
    closed: AtomicBool,
    // Serialises flushes so batches reach the backend in order.
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    shutdown: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Outcome of the one shutdown sequence, shared by every `close` caller.
    closing: OnceCell<Option<String>>,
}

impl Shared {
    fn batch(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> usize {
        self.batch().len()
    }

    /// Stop the worker, flush one last time and close the backend. Returns
    /// the backend's close error, if any.
    async fn shut_down(&self) -> Option<String> {
        self.shutdown.notify_one();
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!(error = %e, "batch worker terminated abnormally");
            }
        }

        self.flush("close").await;
        match self.backend.close().await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "failed to close store backend");
                Some(e.to_string())
            }
        }
    }

    async fn flush(&self, trigger: &'static str) {
        let _serial = self.flush_lock.lock().await;

        let entries = {
            let mut batch = self.batch();
            if batch.is_empty() {
                return;
            }
            std::mem::replace(&mut *batch, Vec::with_capacity(self.batch_size))
        };

        // The batch is gone from memory either way: failed batches are
        // dropped, not requeued.
        match self.backend.execute_batch(&entries).await {
            Ok(()) => info!(entries = entries.len(), trigger, "batch executed"),
            Err(e) => error!(
                entries = entries.len(),
                trigger,
                error = %e,
                "failed to execute batch, dropping entries"
            ),
        }
    }
}

/// In-memory batching front of a [`StoreBackend`].
///
/// `insert` is a plain append under a mutex plus a wake-up; it never waits
/// on the backend. A background task owned by the store flushes the batch
/// every `flush_interval`, or as soon as `batch_size` entries are pending.
///
/// Cloning is cheap and every clone refers to the same batch and worker.
#[derive(Clone)]
pub struct BatchStore {
    shared: Arc<Shared>,
}

impl BatchStore {
    /// Create the store and spawn its flush worker on the current Tokio
    /// runtime.
    ///
    /// **Returns**
    /// - `Err(StoreError::Config)` for a zero batch size or zero interval.
    /// - `Err(StoreError::NoRuntime)` when called outside a Tokio runtime.
    ///
    /// No worker is spawned when an error is returned.
    pub fn new(backend: Arc<dyn StoreBackend>, options: StoreOptions) -> Result<Self, StoreError> {
        if options.batch_size == 0 {
            return Err(StoreError::Config("batch_size must be at least 1".into()));
        }
        if options.flush_interval.is_zero() {
            return Err(StoreError::Config("flush_interval must be non-zero".into()));
        }
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;

        let shared = Arc::new(Shared {
            backend,
            batch_size: options.batch_size,
            batch: Mutex::new(Vec::with_capacity(options.batch_size)),
            closed: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            shutdown: Notify::new(),
            worker: Mutex::new(None),
            closing: OnceCell::new(),
        });

        let handle = runtime.spawn(run_worker(Arc::clone(&shared), options.flush_interval));
        *shared.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        Ok(Self { shared })
    }

    /// Append one row to the pending batch.
    ///
    /// **Returns**
    /// - `Err(StoreError::Closed)` once [`BatchStore::close`] has started.
    /// - `Err(StoreError::Arity)` if `values` does not match the statement.
    pub fn insert(
        &self,
        statement: Arc<InsertStatement>,
        values: Vec<QueryValue>,
    ) -> Result<(), StoreError> {
        if values.len() != statement.columns.len() {
            return Err(StoreError::Arity {
                table: statement.table.clone(),
                expected: statement.columns.len(),
                got: values.len(),
            });
        }

        let mut batch = self.shared.batch();
        // Checked under the batch lock so the final flush in `close` sees
        // every insert that got past this point.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        debug!(table = %statement.table, "add entry to batch");
        batch.push(Entry { statement, values });
        if batch.len() >= self.shared.batch_size {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Number of entries waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    pub fn batch_size(&self) -> usize {
        self.shared.batch_size
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Flush whatever is pending right now, regardless of thresholds.
    pub async fn flush(&self) {
        self.shared.flush("manual").await;
    }

    /// Stop accepting inserts, stop the worker, flush one last time and
    /// close the backend.
    ///
    /// Every caller, concurrent or later, waits for that single shutdown
    /// sequence to finish and gets its outcome; a backend close error is
    /// reported to each of them.
    pub async fn close(&self) -> Result<(), StoreError> {
        {
            let _batch = self.shared.batch();
            self.shared.closed.store(true, Ordering::SeqCst);
        }

        let shared = &self.shared;
        match shared.closing.get_or_init(|| shared.shut_down()).await {
            None => Ok(()),
            Some(reason) => Err(StoreError::Backend(reason.clone().into())),
        }
    }
}

async fn run_worker(shared: Arc<Shared>, interval: Duration) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.notified() => break,
            _ = shared.wake.notified() => {
                // A wake-up may be stale if the timer already drained the batch.
                if shared.pending() >= shared.batch_size {
                    shared.flush("size").await;
                    ticker.reset();
                }
            }
            _ = ticker.tick() => shared.flush("interval").await,
        }
    }

    debug!("batch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_statement_renders_template() {
        assert_eq!(
            InsertStatement::logs().query(),
            "INSERT INTO logs (timestamp, level, message, attributes) VALUES (?, ?, ?, ?)"
        );
    }

    #[test]
    fn default_options_match_documented_values() {
        let options = StoreOptions::default();
        assert_eq!(options.batch_size, 5);
        assert_eq!(options.flush_interval, Duration::from_secs(1));
    }
}
