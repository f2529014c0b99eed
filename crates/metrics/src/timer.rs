use std::time::Instant;

use crate::counters::CounterRegistry;

/// Records elapsed time against `<name>.ok` on drop, or `<name>.error` if
/// [`mark_failure`](Self::mark_failure) was called first.
///
/// Mirrors the teacher's `Timer<T>` drop-based pattern (`crates/metrics/src/timer.rs`)
/// without the Prometheus histogram backing, which is out of scope here.
pub struct StatusTimer<'a> {
    start: Instant,
    registry: &'a CounterRegistry,
    name: &'static str,
    failed: bool,
}

impl<'a> StatusTimer<'a> {
    pub fn new(registry: &'a CounterRegistry, name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            registry,
            name,
            failed: false,
        }
    }

    pub fn mark_failure(&mut self) {
        self.failed = true;
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for StatusTimer<'_> {
    fn drop(&mut self) {
        let suffix = if self.failed { "error" } else { "ok" };
        self.registry.increment(&format!("{}.{suffix}", self.name));
        tracing::trace!(name = self.name, suffix, elapsed = ?self.elapsed(), "status_timer");
    }
}
