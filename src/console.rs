use crate::attrs;
use crate::record::{Attr, Level, LogRecord};
use crate::sink::{Sink, SinkError};
use serde_json::{Map, Value};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Terminal [`Sink`] writing one JSON object per record.
///
/// Output looks like
/// `{"time":"...","level":"INFO","msg":"...","http.path":"/"}`, with
/// attribute keys flattened the same way the persister flattens them.
/// Derived sinks share the writer.
#[derive(Clone)]
pub struct ConsoleSink {
    writer: SharedWriter,
    min_level: Level,
    attrs: Vec<Attr>,
    groups: Vec<String>,
}

impl ConsoleSink {
    /// Console sink writing to stdout.
    pub fn stdout(min_level: Level) -> Self {
        Self::with_writer(min_level, io::stdout())
    }

    pub fn with_writer<W>(min_level: Level, writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            min_level,
            attrs: Vec::new(),
            groups: Vec::new(),
        }
    }

    fn render(&self, record: &LogRecord) -> Result<Vec<u8>, SinkError> {
        let mut obj = Map::new();
        obj.insert("time".into(), Value::String(record.timestamp.to_rfc3339()));
        obj.insert("level".into(), Value::String(record.level.to_string()));
        obj.insert("msg".into(), Value::String(record.message.clone()));
        for (key, value) in attrs::shape(&self.attrs, &self.groups, record) {
            obj.insert(key, Value::String(value));
        }

        let mut line = serde_json::to_vec(&Value::Object(obj))?;
        line.push(b'\n');
        Ok(line)
    }
}

impl Sink for ConsoleSink {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn handle(&self, record: LogRecord) -> Result<(), SinkError> {
        let line = self.render(&record)?;
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writer.write_all(&line)?;
        writer.flush()?;
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
