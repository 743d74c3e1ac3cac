use crate::record::{Attr, AttrValue, Level, LogRecord};
use crate::sink::Sink;
use chrono::Utc;
use std::sync::Arc;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Events emitted by this crate itself (flush reports, retries) are not fed
/// back into the sinks.
pub(crate) const OWN_TARGET: &str = "tracing_log_fanout";

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// hands them to a [`Sink`], usually a [`FanOut`](crate::fanout::FanOut).
///
/// The event's `message` field becomes the record message, the other fields
/// become attributes, and the names of the enclosing spans (root first)
/// become the record's source groups. Delivery is synchronous; a persister
/// behind the sink only appends to its store's in-memory batch.
pub struct SinkLayer {
    sink: Arc<dyn Sink>,
}

impl SinkLayer {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(OWN_TARGET) {
            return;
        }

        let level = Level::from(meta.level());
        if !self.sink.enabled(level) {
            return;
        }

        let mut attributes = Vec::new();
        let mut message: Option<String> = None;
        let mut visitor = FieldVisitor {
            attributes: &mut attributes,
            message: &mut message,
        };
        event.record(&mut visitor);

        let source_groups = ctx
            .event_scope(event)
            .map(|scope| scope.from_root().map(|span| span.name().to_string()).collect())
            .unwrap_or_default();

        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.unwrap_or_default(),
            attributes,
            source_groups,
        };

        if let Err(e) = self.sink.handle(record) {
            eprintln!("log sink delivery failed: {}", e);
        }
    }
}

use tracing::field::{Field, Visit};

pub struct FieldVisitor<'a> {
    pub attributes: &'a mut Vec<Attr>,
    pub message: &'a mut Option<String>,
}

impl<'a> FieldVisitor<'a> {
    fn push(&mut self, field: &Field, value: AttrValue) {
        self.attributes.push(Attr {
            key: field.name().to_string(),
            value,
        });
    }
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.push(field, AttrValue::Str(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, AttrValue::Int(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, AttrValue::UInt(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, AttrValue::Float(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, AttrValue::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.push(field, AttrValue::Str(format!("{:?}", value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    #[derive(Clone)]
    struct Capture {
        min_level: Level,
        records: Arc<Mutex<Vec<LogRecord>>>,
    }

    impl Sink for Capture {
        fn enabled(&self, level: Level) -> bool {
            level >= self.min_level
        }

        fn handle(&self, record: LogRecord) -> Result<(), SinkError> {
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        fn with_attrs(&self, _attrs: &[Attr]) -> Arc<dyn Sink> {
            Arc::new(self.clone())
        }

        fn with_group(&self, _name: &str) -> Arc<dyn Sink> {
            Arc::new(self.clone())
        }
    }

    #[test]
    fn converts_events_with_span_groups() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Capture {
            min_level: Level::Info,
            records: Arc::clone(&records),
        };
        let subscriber = Registry::default().with(SinkLayer::new(Arc::new(sink)));

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("request");
            let _outer = outer.enter();
            let inner = tracing::info_span!("db");
            let _inner = inner.enter();

            tracing::debug!(target: "app", "filtered out");
            tracing::warn!(target: "app", rows = 3u64, table = "posts", "slow query");
            tracing::error!("emitted from inside the crate, skipped");
        });

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, Level::Warn);
        assert_eq!(record.message, "slow query");
        assert_eq!(record.source_groups, vec!["request".to_string(), "db".to_string()]);
        assert_eq!(
            record.attributes,
            vec![Attr::new("rows", 3u64), Attr::new("table", "posts")]
        );
    }
}
