use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// A tag attached to a counter or timer sample, e.g. `resource=posts`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StaticMetricLabel {
    pub key: &'static str,
    pub value: String,
}

impl StaticMetricLabel {
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Monotonic named counters, keyed by a plain string name.
///
/// This is intentionally process-local and dependency-light: the spec
/// treats metrics as an ambient concern, not a feature to build an
/// exporter for.
#[derive(Default)]
pub struct CounterRegistry {
    counters: DashMap<String, AtomicU64>,
}

impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
