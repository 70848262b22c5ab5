//! Client metric registry
//!
//! Named counters and gauges that live for the whole process. Metrics are
//! registered once (from daemon code or on behalf of a local client through
//! the upload API) and updated lock-free afterwards. The registry can render
//! itself in the Prometheus text exposition format.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use thiserror::Error;

/// Metric registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    /// Name was already registered by daemon code
    #[error("metric {0} is already published by the daemon")]
    AlreadyPublished(String),

    /// Name was registered with a different kind
    #[error("metric {name} is a {have}, not a {want}")]
    KindMismatch {
        name: String,
        have: Kind,
        want: Kind,
    },
}

/// Result type for registry operations
pub type MetricsResult<T> = Result<T, MetricsError>;

/// What a metric measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Monotonically increasing value
    Counter,
    /// Value that can go up and down
    Gauge,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created a metric. Uploaded metrics may be re-registered by later
/// uploads; metrics published by daemon code may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Code,
    Upload,
}

struct Entry {
    kind: Kind,
    channel: Channel,
    value: Arc<AtomicI64>,
}

/// Handle to a registered metric. Cloning is cheap; all clones update the
/// same value.
#[derive(Debug, Clone)]
pub struct Metric {
    kind: Kind,
    value: Arc<AtomicI64>,
}

impl Metric {
    /// Add a delta to the metric. Lock-free.
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Set the current value. Only meaningful for gauges.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// The metric's kind.
    pub fn kind(&self) -> Kind {
        self.kind
    }
}

/// A set of named metrics. The daemon has exactly one (see [`global`]);
/// separate instances exist only in tests.
#[derive(Default)]
pub struct Registry {
    // Guards the name->entry map only. Values are updated atomically
    // without the lock.
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a counter from daemon code.
    ///
    /// Panics if the name is taken; two pieces of daemon code claiming the
    /// same metric name is a bug.
    pub fn new_counter(&self, name: &str) -> Metric {
        self.register_code(name, Kind::Counter)
    }

    /// Register a gauge from daemon code. Panics if the name is taken.
    pub fn new_gauge(&self, name: &str) -> Metric {
        self.register_code(name, Kind::Gauge)
    }

    fn register_code(&self, name: &str, kind: Kind) -> Metric {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            panic!("duplicate metric registration: {name}");
        }
        let value = Arc::new(AtomicI64::new(0));
        entries.insert(
            name.to_string(),
            Entry {
                kind,
                channel: Channel::Code,
                value: value.clone(),
            },
        );
        Metric { kind, value }
    }

    /// Register a metric on behalf of the upload API.
    ///
    /// Re-registering an uploaded metric with the same kind returns the
    /// existing handle. Names already published by daemon code, and kind
    /// changes, are errors; the prior metric is left untouched.
    pub fn register_uploaded(&self, name: &str, kind: Kind) -> MetricsResult<Metric> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(name) {
            if entry.channel == Channel::Code {
                return Err(MetricsError::AlreadyPublished(name.to_string()));
            }
            if entry.kind != kind {
                return Err(MetricsError::KindMismatch {
                    name: name.to_string(),
                    have: entry.kind,
                    want: kind,
                });
            }
            return Ok(Metric {
                kind: entry.kind,
                value: entry.value.clone(),
            });
        }
        let value = Arc::new(AtomicI64::new(0));
        entries.insert(
            name.to_string(),
            Entry {
                kind,
                channel: Channel::Upload,
                value: value.clone(),
            },
        );
        Ok(Metric { kind, value })
    }

    /// Whether a name exists at all, regardless of channel.
    pub fn has_published(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    /// Render every metric in the Prometheus text exposition format,
    /// sorted by name.
    pub fn write_prometheus(&self, out: &mut String) {
        let entries = self.entries.lock().unwrap();
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        for name in names {
            let entry = &entries[name];
            let v = entry.value.load(Ordering::Relaxed);
            let _ = writeln!(out, "# TYPE {} {}", name, entry.kind.as_str());
            let _ = writeln!(out, "{} {}", name, v);
        }
    }
}

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

/// The process-wide registry.
pub fn global() -> Arc<Registry> {
    GLOBAL.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add() {
        let r = Registry::new();
        let m = r.new_counter("test_requests");
        m.add(1);
        m.add(2);
        assert_eq!(m.value(), 3);
    }

    #[test]
    fn test_gauge_set() {
        let r = Registry::new();
        let m = r.new_gauge("test_depth");
        m.set(7);
        m.add(-2);
        assert_eq!(m.value(), 5);
    }

    #[test]
    #[should_panic(expected = "duplicate metric registration")]
    fn test_code_duplicate_panics() {
        let r = Registry::new();
        r.new_counter("test_dup");
        r.new_counter("test_dup");
    }

    #[test]
    fn test_uploaded_vs_code_collision() {
        let r = Registry::new();
        let m = r.new_counter("test_published");
        m.add(5);
        let err = r.register_uploaded("test_published", Kind::Counter).unwrap_err();
        assert_eq!(err, MetricsError::AlreadyPublished("test_published".into()));
        // Collision must not disturb the prior metric.
        assert_eq!(m.value(), 5);
    }

    #[test]
    fn test_uploaded_reregistration_same_kind() {
        let r = Registry::new();
        let a = r.register_uploaded("test_up", Kind::Counter).unwrap();
        a.add(1);
        let b = r.register_uploaded("test_up", Kind::Counter).unwrap();
        b.add(1);
        assert_eq!(a.value(), 2);
    }

    #[test]
    fn test_uploaded_kind_mismatch() {
        let r = Registry::new();
        let a = r.register_uploaded("test_kind", Kind::Counter).unwrap();
        a.add(9);
        let err = r.register_uploaded("test_kind", Kind::Gauge).unwrap_err();
        assert_eq!(
            err,
            MetricsError::KindMismatch {
                name: "test_kind".into(),
                have: Kind::Counter,
                want: Kind::Gauge,
            }
        );
        assert_eq!(a.value(), 9);
    }

    #[test]
    fn test_prometheus_format() {
        let r = Registry::new();
        r.new_counter("test_b").add(2);
        r.new_gauge("test_a").set(-1);
        let mut out = String::new();
        r.write_prometheus(&mut out);
        assert_eq!(
            out,
            "# TYPE test_a gauge\ntest_a -1\n# TYPE test_b counter\ntest_b 2\n"
        );
    }

    #[test]
    fn test_has_published() {
        let r = Registry::new();
        assert!(!r.has_published("test_missing"));
        r.new_counter("test_present");
        assert!(r.has_published("test_present"));
        r.register_uploaded("test_uploaded", Kind::Gauge).unwrap();
        assert!(r.has_published("test_uploaded"));
    }
}
