use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Ordered severity of a [`LogRecord`].
///
/// Unlike [`tracing::Level`], comparisons follow severity: `Trace` is the
/// lowest and `Error` the highest, so `level >= min_level` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// Parse a level name, case-insensitively. `warning` is accepted as `Warn`.
    pub fn parse(s: &str) -> Option<Level> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        Level::from(&level)
    }
}

/// Value carried by an [`Attr`]: a scalar or a nested group of attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Group(Vec<Attr>),
}

impl AttrValue {
    pub fn is_group(&self) -> bool {
        matches!(self, AttrValue::Group(_))
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::UInt(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Group(attrs) => {
                f.write_str("{")?;
                for (i, attr) in attrs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}={}", attr.key, attr.value)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::UInt(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// A single key/value pair attached to a record or a derived sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attr {
    pub key: String,
    pub value: AttrValue,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Attr {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn group(key: impl Into<String>, members: Vec<Attr>) -> Self {
        Attr {
            key: key.into(),
            value: AttrValue::Group(members),
        }
    }
}

/// Snapshot of one structured log event.
///
/// Every field is owned, so `clone()` yields a fully independent copy that
/// one sink can consume without another sink observing the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub attributes: Vec<Attr>,
    /// Group names, outermost first, that prefix every key in `attributes`.
    pub source_groups: Vec<String>,
}

impl LogRecord {
    /// Build a record stamped with the current wall-clock time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            attributes: Vec::new(),
            source_groups: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.push(Attr::new(key, value));
        self
    }

    pub fn with_source_group(mut self, name: impl Into<String>) -> Self {
        self.source_groups.push(name.into());
        self
    }
}
