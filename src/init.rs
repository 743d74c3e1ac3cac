use crate::backend::{make_backend_from_config, parse_dsn, BackendBuildError};
use crate::console::ConsoleSink;
use crate::env;
use crate::fanout::FanOut;
use crate::layer::{SinkLayer, OWN_TARGET};
use crate::persister::{Persister, PersisterConfig};
use crate::record::Level;
use crate::sink::Sink;
use crate::store::{BatchStore, InsertStatement, StoreError, StoreOptions};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{Metadata, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, Layered, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Registry;

/// Logging pipeline configuration.
///
/// **Fields**
/// - `batch_size`: pending rows that trigger a store flush.
/// - `flush_interval`: maximum time between flushes while rows are pending.
/// - `min_level`: records below this level are not persisted.
/// - `enable_stdout`: if `true`, a JSON [`ConsoleSink`] is registered in
///   front of the persister in the fan-out, and the crate's own warnings
///   (failed flushes, insert retries) are printed to stdout.
/// - `stdout_level`: minimum level printed by the console sink.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub min_level: Level,
    pub enable_stdout: bool,
    pub stdout_level: Level,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            flush_interval: Duration::from_secs(1),
            min_level: Level::Info,
            enable_stdout: true,
            stdout_level: Level::Debug,
        }
    }
}

impl LayerConfig {
    /// Defaults overridden by the `LOG_SINK_*` variables from [`env`].
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env::env_parse_or(env::LOG_SINK_BATCH_SIZE_ENV, defaults.batch_size),
            flush_interval: env::env_millis_or(env::LOG_SINK_FLUSH_INTERVAL_MS_ENV, defaults.flush_interval),
            min_level: env::env_level_or(env::LOG_SINK_MIN_LEVEL_ENV, defaults.min_level),
            enable_stdout: env::env_flag_or(env::LOG_SINK_STDOUT_ENV, defaults.enable_stdout),
            stdout_level: env::env_level_or(env::LOG_SINK_STDOUT_LEVEL_ENV, defaults.stdout_level),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Backend(#[from] BackendBuildError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to install global subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Build the fan-out for `store`: optional stdout sink first, then the
/// persister.
pub fn build_fanout(store: &BatchStore, config: &LayerConfig) -> FanOut {
    let mut fanout = FanOut::default();
    if config.enable_stdout {
        fanout.push(Arc::new(ConsoleSink::stdout(config.stdout_level)));
    }
    fanout.push(Arc::new(Persister::new(
        store.clone(),
        PersisterConfig {
            min_level: config.min_level,
            statement: InsertStatement::logs(),
        },
    )));
    fanout
}

fn is_own_warning(meta: &Metadata<'_>) -> bool {
    meta.target().starts_with(OWN_TARGET) && *meta.level() <= tracing::Level::WARN
}

/// Plain-text `fmt` layer for the crate's own `WARN` and `ERROR` events.
///
/// [`SinkLayer`] never forwards these events to the sinks, so without this
/// layer a failing backend would drop batches silently.
pub fn diagnostics_layer<S, W>(make_writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(make_writer)
        .with_ansi(false)
        .with_filter(filter_fn(is_own_warning))
}

/// Registry with a [`SinkLayer`] over `sink`, plus a [`diagnostics_layer`]
/// writing to `diagnostics` when one is given.
pub fn build_subscriber<W>(sink: Arc<dyn Sink>, diagnostics: Option<W>) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    Registry::default()
        .with(SinkLayer::new(sink))
        .with(diagnostics.map(diagnostics_layer::<Layered<SinkLayer, Registry>, W>))
}

/// Install `sink` behind a [`SinkLayer`] as the global `tracing`
/// subscriber. With `diagnostics` set, the crate's own warnings go to
/// stdout.
pub fn install(sink: Arc<dyn Sink>, diagnostics: bool) -> Result<(), InitError> {
    let subscriber = build_subscriber(sink, diagnostics.then_some(std::io::stdout));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Initialize global `tracing` with a fan-out over `store` using the
/// provided [`LayerConfig`].
///
/// The caller keeps `store` and must call [`BatchStore::close`] on shutdown
/// so the last batch is flushed.
pub fn init_tracing_with_config(store: &BatchStore, config: &LayerConfig) -> Result<(), InitError> {
    install(Arc::new(build_fanout(store, config)), config.enable_stdout)
}

/// Equivalent to [`init_tracing_with_config`] with [`LayerConfig::default`].
pub fn init_tracing(store: &BatchStore) -> Result<(), InitError> {
    init_tracing_with_config(store, &LayerConfig::default())
}

/// Build the backend named by `LOG_SINK_DSN` (in-memory when unset), start
/// a [`BatchStore`] over it and install the global subscriber.
///
/// Must be called from within a Tokio runtime. Construction failures are
/// returned before anything is installed.
pub fn init_from_env() -> Result<BatchStore, InitError> {
    let config = LayerConfig::from_env();
    let dsn = env::env_or(env::LOG_SINK_DSN_ENV, "memory://");

    let backend_config = parse_dsn(&dsn).map_err(BackendBuildError::from)?;
    let backend = make_backend_from_config(&backend_config)?;
    let store = BatchStore::new(backend, config.store_options())?;

    init_tracing_with_config(&store, &config)?;
    Ok(store)
}
