pub mod record;
pub mod attrs;
pub mod sink;
pub mod fanout;
pub mod store;
pub mod persister;
pub mod console;
pub mod memory;
pub mod backend;

#[cfg(feature = "clickhouse")]
pub mod clickhouse;

pub mod env;
pub mod layer;
pub mod init;

pub use fanout::FanOut;
pub use persister::Persister;
pub use record::{Attr, AttrValue, Level, LogRecord};
pub use sink::{Sink, SinkError};
pub use store::{BatchStore, StoreBackend, StoreOptions};
