use crate::attrs;
use crate::record::{Attr, Level, LogRecord};
use crate::sink::{Sink, SinkError};
use crate::store::{BatchStore, InsertStatement, QueryValue};
use std::sync::Arc;

/// Produces extra attributes at handle time, e.g. from task-local request
/// context.
pub type AttrExtractor = Arc<dyn Fn() -> Vec<Attr> + Send + Sync>;

/// Configuration for [`Persister`].
#[derive(Clone, Debug)]
pub struct PersisterConfig {
    /// Records below this level are not persisted.
    pub min_level: Level,
    /// Row shape written for every record. Must have four columns:
    /// timestamp, level, message and attribute map.
    pub statement: InsertStatement,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            min_level: Level::Debug,
            statement: InsertStatement::logs(),
        }
    }
}

/// [`Sink`] that turns each record into one row on a shared [`BatchStore`].
///
/// `handle` only appends to the store's in-memory batch; durability is the
/// store's business. Derived persisters share the store and carry their own
/// copy of the accumulated attributes and groups.
#[derive(Clone)]
pub struct Persister {
    store: BatchStore,
    min_level: Level,
    statement: Arc<InsertStatement>,
    attrs: Vec<Attr>,
    groups: Vec<String>,
    extractors: Vec<AttrExtractor>,
}

impl Persister {
    pub fn new(store: BatchStore, config: PersisterConfig) -> Self {
        Self {
            store,
            min_level: config.min_level,
            statement: Arc::new(config.statement),
            attrs: Vec::new(),
            groups: Vec::new(),
            extractors: Vec::new(),
        }
    }

    /// Add an extractor whose attributes are appended, ungrouped, to every
    /// persisted record.
    pub fn with_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn() -> Vec<Attr> + Send + Sync + 'static,
    {
        self.extractors.push(Arc::new(extractor));
        self
    }

    pub fn store(&self) -> &BatchStore {
        &self.store
    }

    fn row(&self, record: &LogRecord) -> Vec<QueryValue> {
        let mut handler_attrs = self.attrs.clone();
        for extract in &self.extractors {
            handler_attrs.extend(extract());
        }

        let attributes = attrs::shape(&handler_attrs, &self.groups, record);
        vec![
            QueryValue::Timestamp(record.timestamp),
            QueryValue::Text(record.level.to_string()),
            QueryValue::Text(record.message.clone()),
            QueryValue::Map(attributes),
        ]
    }
}

impl Sink for Persister {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn handle(&self, record: LogRecord) -> Result<(), SinkError> {
        let values = self.row(&record);
        self.store.insert(Arc::clone(&self.statement), values)?;
        Ok(())
    }

    fn with_attrs(&self, attrs: &[Attr]) -> Arc<dyn Sink> {
        let mut derived = self.clone();
        derived.attrs = attrs::append_attrs_to_group(&self.groups, &self.attrs, attrs);
        Arc::new(derived)
    }

    fn with_group(&self, name: &str) -> Arc<dyn Sink> {
        let mut derived = self.clone();
        if !name.is_empty() {
            derived.groups.push(name.to_string());
        }
        Arc::new(derived)
    }
}
