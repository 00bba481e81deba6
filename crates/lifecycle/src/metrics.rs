//! Metrics collection seam.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sink for counters, gauges and timings. Names are dotted; tags are
/// `key:value` strings.
pub trait MetricsCollector: Send + Sync {
    fn increment(&self, name: &str, tags: &[String]);
    fn gauge(&self, name: &str, value: f64, tags: &[String]);
    fn timing(&self, name: &str, elapsed: Duration, tags: &[String]);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {
    fn increment(&self, _name: &str, _tags: &[String]) {}
    fn gauge(&self, _name: &str, _value: f64, _tags: &[String]) {}
    fn timing(&self, _name: &str, _elapsed: Duration, _tags: &[String]) {}
}

/// Keeps counts in memory, keyed by metric name with tags ignored.
#[derive(Debug, Default)]
pub struct MemoryCollector {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    timings: DashMap<String, Vec<Vec<String>>>,
}

impl MemoryCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|g| *g)
    }

    /// Tag sets of every timing recorded under `name`.
    #[must_use]
    pub fn timings(&self, name: &str) -> Vec<Vec<String>> {
        self.timings.get(name).map(|t| t.value().clone()).unwrap_or_default()
    }
}

impl MetricsCollector for MemoryCollector {
    fn increment(&self, name: &str, _tags: &[String]) {
        *self.counters.entry(name.to_string()).or_default() += 1;
    }

    fn gauge(&self, name: &str, value: f64, _tags: &[String]) {
        self.gauges.insert(name.to_string(), value);
    }

    fn timing(&self, name: &str, _elapsed: Duration, tags: &[String]) {
        self.timings.entry(name.to_string()).or_default().push(tags.to_vec());
    }
}

/// A running timer, reported when finished.
#[must_use = "a timing is only recorded when finished"]
pub struct Timing {
    collector: Arc<dyn MetricsCollector>,
    name: String,
    tags: Vec<String>,
    started: Instant,
}

impl Timing {
    pub fn start(collector: &Arc<dyn MetricsCollector>, name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            collector: Arc::clone(collector),
            name: name.into(),
            tags,
            started: Instant::now(),
        }
    }

    /// Record the elapsed time with `extra` tags appended.
    pub fn finish(mut self, extra: &[String]) {
        self.tags.extend_from_slice(extra);
        self.collector.timing(&self.name, self.started.elapsed(), &self.tags);
    }
}
