use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the pipeline.
///
/// Purpose:
/// - Track aggregation throughput (batches, entries, failures)
/// - Track cycle health (overruns)
/// - Track worker fleet size and command traffic
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe in async + multithreaded contexts
#[derive(Default)]
pub struct RuntimeMetrics {
    // Aggregator
    pub cycles: AtomicUsize,
    pub cycles_overrun: AtomicUsize,
    pub batches_written: AtomicUsize,
    pub write_failures: AtomicUsize,
    pub entries_committed: AtomicUsize,
    pub queue_errors: AtomicUsize,

    // Supervisor / spawner
    pub workers_active: AtomicUsize,
    pub commands_sent: AtomicUsize,

    // Workers
    pub events_published: AtomicUsize,
    pub parse_errors: AtomicUsize,
    pub ws_reconnects: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary for the periodic reporter.
    pub fn summary(&self) -> String {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        format!(
            "cycles={} overrun={} batches={} write_err={} committed={} queue_err={} workers={} cmds={} published={} parse_err={} reconnects={}",
            get(&self.cycles),
            get(&self.cycles_overrun),
            get(&self.batches_written),
            get(&self.write_failures),
            get(&self.entries_committed),
            get(&self.queue_errors),
            get(&self.workers_active),
            get(&self.commands_sent),
            get(&self.events_published),
            get(&self.parse_errors),
            get(&self.ws_reconnects),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
