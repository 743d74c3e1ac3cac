use crate::fanout::FanOutError;
use crate::record::{Attr, Level, LogRecord};
use crate::store::StoreError;
use std::sync::Arc;

/// Destination for structured [`LogRecord`]s.
///
/// This is the handler capability the logging call sites drive: a level
/// check, synchronous delivery, and derivation of new sinks carrying extra
/// attributes or a group prefix. Derivation never mutates `self`; the
/// returned sink is a separate value and the original keeps behaving as
/// before.
pub trait Sink: Send + Sync {
    /// Whether a record at `level` would be accepted.
    fn enabled(&self, level: Level) -> bool;

    /// Deliver one record.
    ///
    /// **Returns**
    /// - `Ok(())` if the record was accepted.
    /// - `Err(..)` if this sink (or, for composites, one of its children)
    ///   failed. Callers are free to ignore the error.
    fn handle(&self, record: LogRecord) -> Result<(), SinkError>;

    /// Derive a sink that adds `attrs` to every record, under the current
    /// group prefix.
    fn with_attrs(&self, attrs: &[Attr]) -> Arc<dyn Sink>;

    /// Derive a sink whose later attributes are nested under `name`.
    ///
    /// An empty `name` yields a sink equivalent to `self`.
    fn with_group(&self, name: &str) -> Arc<dyn Sink>;
}

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sink panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    FanOut(#[from] FanOutError),

    #[error("write error: {0}")]
    Write(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
