use crate::store::{BoxError, Entry, StoreBackend};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Backend that keeps every executed batch in memory.
///
/// Useful for dry runs, load tests without external I/O, and unit tests
/// that want to inspect exactly what was flushed. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    batches: Arc<Mutex<Vec<Vec<Entry>>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `execute_batch` calls fail (and record nothing)
    /// until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successfully executed batches, oldest first.
    pub fn batches(&self) -> Vec<Vec<Entry>> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Entries across all successful batches, in flush order.
    pub fn entries(&self) -> Vec<Entry> {
        self.batches().into_iter().flatten().collect()
    }

    /// Number of `execute_batch` calls, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn execute_batch(&self, entries: &[Entry]) -> Result<(), BoxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err("memory backend set to fail".into());
        }
        self.batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entries.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
