use crate::record::{Attr, Level, LogRecord};
use crate::sink::{Sink, SinkError};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Composite [`Sink`] replicating each record to an ordered list of
/// children.
///
/// Children are tried in registration order. Each one gets its own copy of
/// the record, and a child that fails or panics does not stop delivery to
/// the ones after it.
#[derive(Clone, Default)]
pub struct FanOut {
    sinks: Vec<Arc<dyn Sink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    /// Register another child after the existing ones.
    pub fn push(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Sink for FanOut {
    fn enabled(&self, level: Level) -> bool {
        self.sinks.iter().any(|sink| sink.enabled(level))
    }

    fn handle(&self, record: LogRecord) -> Result<(), SinkError> {
        let mut failures = Vec::new();

        for (index, sink) in self.sinks.iter().enumerate() {
            if !sink.enabled(record.level) {
                continue;
            }
            let copy = record.clone();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.handle(copy)))
                .unwrap_or_else(|payload| Err(SinkError::Panicked(panic_message(payload))));
            if let Err(error) = outcome {
                failures.push(ChildFailure { index, error });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SinkError::FanOut(FanOutError { failures }))
        }
    }

    fn with_attrs(&self, attrs: &[Attr]) -> Arc<dyn Sink> {
        Arc::new(FanOut {
            sinks: self.sinks.iter().map(|sink| sink.with_attrs(attrs)).collect(),
        })
    }

    fn with_group(&self, name: &str) -> Arc<dyn Sink> {
        if name.is_empty() {
            return Arc::new(self.clone());
        }
        Arc::new(FanOut {
            sinks: self.sinks.iter().map(|sink| sink.with_group(name)).collect(),
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unexpected panic payload".to_string()
    }
}

/// One child that failed during [`FanOut::handle`].
#[derive(Debug)]
pub struct ChildFailure {
    /// Registration index of the child.
    pub index: usize,
    pub error: SinkError,
}

/// Every child failure from one fan-out delivery.
#[derive(Debug)]
pub struct FanOutError {
    pub failures: Vec<ChildFailure>,
}

impl FanOutError {
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

impl fmt::Display for FanOutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sink(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; [{}] {}", failure.index, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FanOutError {}
