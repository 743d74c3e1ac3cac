use std::sync::{Arc, Mutex};

use tokio::time::Duration;
use tracing_log_fanout::fanout::FanOut;
use tracing_log_fanout::memory::MemoryBackend;
use tracing_log_fanout::persister::{Persister, PersisterConfig};
use tracing_log_fanout::store::{BatchStore, StoreOptions};
use tracing_log_fanout::{Attr, Level, LogRecord, Sink, SinkError};

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    Accept,
    Fail,
    Panic,
    Mutate,
}

/// Test sink recording what it handled into a journal shared by siblings.
#[derive(Clone)]
struct Probe {
    name: &'static str,
    min_level: Level,
    behavior: Behavior,
    attrs: Vec<Attr>,
    journal: Journal,
}

impl Probe {
    fn new(name: &'static str, min_level: Level, behavior: Behavior, journal: &Journal) -> Arc<dyn Sink> {
        Arc::new(Probe {
            name,
            min_level,
            behavior,
            attrs: Vec::new(),
            journal: Arc::clone(journal),
        })
    }
}

type Journal = Arc<Mutex<Vec<(&'static str, LogRecord, Vec<Attr>)>>>;

impl Sink for Probe {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    fn handle(&self, mut record: LogRecord) -> Result<(), SinkError> {
        match self.behavior {
            Behavior::Panic => panic!("{} exploded", self.name),
            Behavior::Mutate => {
                record.message.push_str(" (mutated)");
                record.attributes.clear();
            }
            _ => {}
        }
        self.journal
            .lock()
            .unwrap()
            .push((self.name, record, self.attrs.clone()));
        if self.behavior == Behavior::Fail {
            return Err(SinkError::Write(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} is down", self.name),
            )));
        }
        Ok(())
    }

    fn with_attrs(&self, attrs: &[Attr]) -> Arc<dyn Sink> {
        let mut derived = self.clone();
        derived.attrs.extend_from_slice(attrs);
        Arc::new(derived)
    }

    fn with_group(&self, name: &str) -> Arc<dyn Sink> {
        let mut derived = self.clone();
        if !name.is_empty() {
            derived.attrs.push(Attr::group(name, vec![]));
        }
        Arc::new(derived)
    }
}

fn names(journal: &Journal) -> Vec<&'static str> {
    journal.lock().unwrap().iter().map(|(name, _, _)| *name).collect()
}

#[test]
fn per_child_level_gates_delivery() {
    let journal = Journal::default();
    let fanout = FanOut::new(vec![
        Probe::new("a", Level::Info, Behavior::Accept, &journal),
        Probe::new("b", Level::Error, Behavior::Accept, &journal),
    ]);

    assert!(fanout.enabled(Level::Warn));
    assert!(!fanout.enabled(Level::Debug));

    fanout.handle(LogRecord::new(Level::Warn, "disk almost full")).unwrap();
    assert_eq!(names(&journal), vec!["a"]);
}

#[test]
fn failing_child_does_not_stop_siblings() {
    let journal = Journal::default();
    let fanout = FanOut::new(vec![
        Probe::new("a", Level::Trace, Behavior::Fail, &journal),
        Probe::new("b", Level::Trace, Behavior::Accept, &journal),
    ]);

    let err = fanout.handle(LogRecord::new(Level::Info, "hello")).unwrap_err();
    assert_eq!(names(&journal), vec!["a", "b"]);

    match err {
        SinkError::FanOut(fanout_err) => {
            assert_eq!(fanout_err.failed_indices(), vec![0]);
            assert!(fanout_err.to_string().contains("a is down"));
        }
        other => panic!("expected aggregated error, got {:?}", other),
    }
}

#[test]
fn panicking_child_is_contained() {
    let journal = Journal::default();
    let fanout = FanOut::new(vec![
        Probe::new("a", Level::Trace, Behavior::Accept, &journal),
        Probe::new("boom", Level::Trace, Behavior::Panic, &journal),
        Probe::new("c", Level::Trace, Behavior::Fail, &journal),
    ]);

    let err = fanout.handle(LogRecord::new(Level::Error, "x")).unwrap_err();
    assert_eq!(names(&journal), vec!["a", "c"]);

    let SinkError::FanOut(fanout_err) = err else {
        panic!("expected aggregated error");
    };
    assert_eq!(fanout_err.failed_indices(), vec![1, 2]);
    assert!(matches!(
        &fanout_err.failures[0].error,
        SinkError::Panicked(msg) if msg == "boom exploded"
    ));
}

#[test]
fn children_get_independent_copies_in_registration_order() {
    let journal = Journal::default();
    let fanout = FanOut::new(vec![
        Probe::new("first", Level::Trace, Behavior::Mutate, &journal),
        Probe::new("second", Level::Trace, Behavior::Accept, &journal),
        Probe::new("third", Level::Trace, Behavior::Accept, &journal),
    ]);

    let record = LogRecord::new(Level::Info, "original").with_attr("k", "v");
    fanout.handle(record.clone()).unwrap();

    let journal = journal.lock().unwrap();
    let order: Vec<&str> = journal.iter().map(|(n, _, _)| *n).collect();
    assert_eq!(order, vec!["first", "second", "third"]);
    assert_eq!(journal[0].1.message, "original (mutated)");
    assert_eq!(journal[1].1, record);
    assert_eq!(journal[2].1, record);
}

#[test]
fn derivation_leaves_original_untouched() {
    let journal = Journal::default();
    let fanout = FanOut::new(vec![
        Probe::new("a", Level::Trace, Behavior::Accept, &journal),
        Probe::new("b", Level::Trace, Behavior::Accept, &journal),
    ]);

    let derived = fanout.with_attrs(&[Attr::new("request_id", "r-1")]);
    derived.handle(LogRecord::new(Level::Info, "derived")).unwrap();
    fanout.handle(LogRecord::new(Level::Info, "original")).unwrap();

    let journal = journal.lock().unwrap();
    assert_eq!(journal.len(), 4);
    assert!(journal[..2].iter().all(|(_, _, attrs)| attrs == &vec![Attr::new("request_id", "r-1")]));
    assert!(journal[2..].iter().all(|(_, _, attrs)| attrs.is_empty()));

    assert_eq!(fanout.with_group("").enabled(Level::Trace), fanout.enabled(Level::Trace));
}

#[test]
fn empty_fanout_accepts_nothing() {
    let fanout = FanOut::default();
    assert!(fanout.is_empty());
    assert!(!fanout.enabled(Level::Error));
    assert!(fanout.handle(LogRecord::new(Level::Error, "dropped")).is_ok());
}

#[tokio::test(start_paused = true)]
async fn healthy_persister_receives_record_when_sibling_fails() {
    let journal = Journal::default();
    let backend = MemoryBackend::new();
    let store = BatchStore::new(
        Arc::new(backend.clone()),
        StoreOptions {
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
        },
    )
    .unwrap();

    let mut fanout = FanOut::default();
    fanout.push(Probe::new("broken", Level::Trace, Behavior::Fail, &journal));
    fanout.push(Arc::new(Persister::new(store.clone(), PersisterConfig::default())));

    let result = fanout.handle(LogRecord::new(Level::Info, "persist me"));
    assert!(matches!(result, Err(SinkError::FanOut(ref e)) if e.failed_indices() == vec![0]));

    store.close().await.unwrap();
    assert_eq!(backend.entries().len(), 1);
}
