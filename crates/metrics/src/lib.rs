//! In-process counters and timers for the sync engine.
//!
//! The teacher wires these into Prometheus; that wiring is transport/ops
//! glue and out of scope here (see spec.md §1). What's kept is the *shape*:
//! a drop-based timer that records elapsed time, and tagged monotonic
//! counters, queryable in-process for tests and for a host to expose
//! however it likes.

mod counters;
mod timer;

pub use counters::{CounterRegistry, StaticMetricLabel};
pub use timer::StatusTimer;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timer_records_elapsed_on_drop() {
        let registry = CounterRegistry::new();
        {
            let _timer = StatusTimer::new(&registry, "query_step");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(registry.count("query_step.ok"), 1);
    }

    #[test]
    fn timer_records_failure_label_when_marked() {
        let registry = CounterRegistry::new();
        {
            let mut timer = StatusTimer::new(&registry, "mutation");
            timer.mark_failure();
        }
        assert_eq!(registry.count("mutation.ok"), 0);
        assert_eq!(registry.count("mutation.error"), 1);
    }
}
