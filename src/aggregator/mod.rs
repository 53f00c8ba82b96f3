//! Aggregator loop
//!
//! Orchestrates window planning, queue reads, sink writes and
//! commits for every tracked key, once per cycle.
//!
//! ORDERING:
//! - Keys are processed sequentially in `Config::tracked_keys` order
//! - A key's entries are committed only after every sink confirmed
//!   the batch; any failure leaves them for the next cycle
//!
//! SUSPENSION POINTS:
//! - The inter-cycle sleep and retry backoff sleeps, both cancellable;
//!   a cancelled sleep never commits

pub mod normalize;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::METRICS;
use crate::queue::DurableQueue;
use crate::schema::{Batch, TrackedKey, Window};
use crate::sink::Storage;
use crate::util;
use crate::window::WindowPlanner;

/// Sleep used instead of a negative duration after an overrun.
pub const MIN_CYCLE_SLEEP: Duration = Duration::from_millis(500);

/// Poll period while no sources are configured.
const IDLE_SLEEP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total write attempts, at least 1
    pub attempts: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            attempts: cfg.storage_retries.max(1),
            wait: cfg.retry_wait(),
        }
    }

    /// Best-effort: one attempt, no backoff.
    pub fn single() -> Self {
        Self {
            attempts: 1,
            wait: Duration::ZERO,
        }
    }
}

/// What happened to one key in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing buffered for the window
    Empty,

    /// Written everywhere and committed
    Committed(usize),

    /// Read, write or commit failed; entries stay buffered
    Failed,

    /// Cancelled during backoff; entries stay buffered
    Aborted,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub committed_keys: usize,
    pub committed_entries: usize,
    pub empty: usize,
    pub failed: usize,
    pub aborted: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Empty => self.empty += 1,
            FlushOutcome::Committed(n) => {
                self.committed_keys += 1;
                self.committed_entries += n;
            }
            FlushOutcome::Failed => self.failed += 1,
            FlushOutcome::Aborted => self.aborted += 1,
        }
    }
}

/// How long to sleep after a cycle that took `elapsed`.
///
/// Returns the sleep and whether the cycle overran its interval.
pub fn pacing(interval: Duration, elapsed: Duration) -> (Duration, bool) {
    match interval.checked_sub(elapsed) {
        Some(rest) if !rest.is_zero() => (rest.max(MIN_CYCLE_SLEEP), false),
        _ => (MIN_CYCLE_SLEEP, true),
    }
}

pub struct Aggregator {
    queue: Arc<dyn DurableQueue>,
    storage: Storage,
    config: watch::Receiver<Arc<Config>>,

    /// End of the last committed (or empty) window per key, calendar
    /// mode only. A failed key keeps its old end, so the next window
    /// for it starts where the failed one did. Only window planning
    /// uses it; reads start at the queue's committed position, so
    /// anything left behind an advanced end is still flushed.
    progress: HashMap<TrackedKey, i64>,
}

impl Aggregator {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        storage: Storage,
        config: watch::Receiver<Arc<Config>>,
    ) -> Self {
        Self {
            queue,
            storage,
            config,
            progress: HashMap::new(),
        }
    }

    /// Runs cycles until `cancel` fires, then the optional final drain.
    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mode = if self.config.borrow().storage_interval.is_calendar() {
            "calendar windows"
        } else {
            "cursor"
        };
        log::info!(
            "aggregator running (queue={}, sinks={:?}, {})",
            self.queue.name(),
            self.storage.names(),
            mode
        );

        while !cancel.is_cancelled() {
            let cfg = self.config.borrow().clone();

            if cfg.sources.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(IDLE_SLEEP) => continue,
                }
            }

            let started = Instant::now();
            let report = self.cycle(&cfg, RetryPolicy::from_config(&cfg), &cancel).await;
            METRICS.cycles.fetch_add(1, Ordering::Relaxed);

            let elapsed = started.elapsed();
            let interval = cfg.storage_interval.as_duration();
            let (wait, overran) = pacing(interval, elapsed);

            // can't keep up with the configured interval
            if overran {
                METRICS.cycles_overrun.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Storage operations currently take {:.1} seconds, longer than the interval of {}s",
                    elapsed.as_secs_f64(),
                    interval.as_secs()
                );
            }

            if report.failed > 0 {
                log::warn!("cycle finished with {} failed keys", report.failed);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        let cfg = self.config.borrow().clone();
        if cfg.drain_on_stop {
            self.drain(&cfg).await;
        }

        log::info!("aggregator stopped");
        Ok(())
    }

    /// Best-effort final pass: one write attempt per key, bounded by
    /// `drain_timeout_secs`. Returns `None` if the deadline hit first.
    pub async fn drain(&mut self, cfg: &Config) -> Option<CycleReport> {
        log::info!("final drain pass (deadline {}s)", cfg.drain_timeout().as_secs());

        let never = CancellationToken::new();
        match timeout(cfg.drain_timeout(), self.cycle(cfg, RetryPolicy::single(), &never)).await {
            Ok(report) => {
                log::info!(
                    "final drain committed {} entries across {} keys ({} failed)",
                    report.committed_entries,
                    report.committed_keys,
                    report.failed
                );
                Some(report)
            }
            Err(_) => {
                log::error!("final drain did not finish within {}s", cfg.drain_timeout().as_secs());
                None
            }
        }
    }

    /// One pass over every tracked key.
    pub async fn cycle(
        &mut self,
        cfg: &Config,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> CycleReport {
        let keys = cfg.tracked_keys();

        // forget progress for keys no longer configured
        let live: HashSet<&TrackedKey> = keys.iter().collect();
        self.progress.retain(|k, _| live.contains(k));

        let planner = WindowPlanner::new(cfg.storage_interval);
        let now = util::now_ms();
        let mut report = CycleReport::default();

        for key in &keys {
            if cancel.is_cancelled() {
                break;
            }

            let window = planner.plan(now, self.progress.get(key).copied());
            let outcome = self.flush_key(key, window, now, policy, cancel).await;
            report.record(outcome);
        }

        report
    }

    /// Read, write with retries, commit, for one key and window.
    pub async fn flush_key(
        &mut self,
        key: &TrackedKey,
        window: Window,
        now: i64,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> FlushOutcome {
        if window.is_empty() {
            return FlushOutcome::Empty;
        }

        log::debug!("Reading {} {}", key, window);
        let entries = match self.queue.read(key, window).await {
            Ok(entries) => entries,
            Err(e) => {
                METRICS.queue_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("{}: read failed, retrying next cycle: {}", key, e);
                return FlushOutcome::Failed;
            }
        };

        if entries.is_empty() {
            log::debug!("No data for {}", key);
            self.advance(key, window);
            return FlushOutcome::Empty;
        }

        let batch = Batch {
            key: key.clone(),
            window,
            flushed_at: now,
            records: normalize::normalize(&entries),
        };

        if !batch.is_empty() {
            let mut delivery = self.storage.delivery();
            let mut attempt = 1;

            loop {
                match self.storage.write(&batch, &mut delivery).await {
                    Ok(()) => break,
                    Err(e) if e.is_transient() && attempt < policy.attempts => {
                        log::warn!(
                            "{}: attempt {}/{} failed ({}, {}/{} sinks confirmed), retrying in {}s",
                            key,
                            attempt,
                            policy.attempts,
                            e,
                            delivery.confirmed(),
                            self.storage.names().len(),
                            policy.wait.as_secs()
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return FlushOutcome::Aborted,
                            _ = sleep(policy.wait) => {}
                        }
                        attempt += 1;
                    }
                    Err(e) => {
                        METRICS.write_failures.fetch_add(1, Ordering::Relaxed);
                        log::error!(
                            "{}: giving up after {} attempt(s), {} entries stay buffered: {}",
                            key,
                            attempt,
                            entries.len(),
                            e
                        );
                        return FlushOutcome::Failed;
                    }
                }
            }
            METRICS.batches_written.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = self.queue.commit(key, &entries).await {
            METRICS.queue_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("{}: commit failed, batch will be re-read: {}", key, e);
            return FlushOutcome::Failed;
        }

        METRICS
            .entries_committed
            .fetch_add(entries.len(), Ordering::Relaxed);
        self.advance(key, window);
        log::info!("Write Complete {} ({} entries, {} rows)", key, entries.len(), batch.len());
        FlushOutcome::Committed(entries.len())
    }

    fn advance(&mut self, key: &TrackedKey, window: Window) {
        if let Some(end) = window.end() {
            self.progress.insert(key.clone(), end);
        }
    }

    #[cfg(test)]
    pub fn progress(&self, key: &TrackedKey) -> Option<i64> {
        self.progress.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::{CalendarUnit, Interval};
    use crate::error::{QueueError, SinkError};
    use crate::queue::memory::MemoryQueue;
    use crate::schema::{QueueEntry, SequenceToken};
    use crate::sink::Sink;

    const CONFIG: &str = r#"{
        "sources": { "X": { "trades": ["BTC-USD"] } },
        "queue": { "backend": "memory" },
        "storage": [ { "type": "jsonl", "path": "unused" } ],
        "storage_interval": 60,
        "storage_retries": 3,
        "storage_retry_wait": 1,
        "drain_on_stop": true
    }"#;

    /// Memory queue that counts commits.
    #[derive(Default)]
    struct CountingQueue {
        inner: MemoryQueue,
        commits: Mutex<Vec<usize>>,
        fail_reads: std::sync::atomic::AtomicBool,

        /// Truncates reads to this many entries, 0 for no limit
        read_limit: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DurableQueue for CountingQueue {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn publish(
            &self,
            key: &TrackedKey,
            timestamp: i64,
            payload: &str,
        ) -> Result<SequenceToken, QueueError> {
            self.inner.publish(key, timestamp, payload).await
        }

        async fn read(&self, key: &TrackedKey, window: Window) -> Result<Vec<QueueEntry>, QueueError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(QueueError::Unavailable("connection refused".into()));
            }
            let mut entries = self.inner.read(key, window).await?;
            match self.read_limit.load(Ordering::SeqCst) {
                0 => {}
                limit => entries.truncate(limit),
            }
            Ok(entries)
        }

        async fn commit(&self, key: &TrackedKey, entries: &[QueueEntry]) -> Result<(), QueueError> {
            self.commits.lock().unwrap().push(entries.len());
            self.inner.commit(key, entries).await
        }

        async fn flush_all(&self) -> Result<(), QueueError> {
            self.inner.flush_all().await
        }
    }

    /// Fails the first `transient` calls, then succeeds.
    struct FlakySink {
        transient: usize,
        permanent: bool,
        calls: AtomicUsize,
        rows: Mutex<Vec<usize>>,
    }

    impl FlakySink {
        fn new(transient: usize) -> Arc<Self> {
            Arc::new(Self {
                transient,
                permanent: false,
                calls: AtomicUsize::new(0),
                rows: Mutex::new(Vec::new()),
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                transient: usize::MAX,
                permanent: true,
                calls: AtomicUsize::new(0),
                rows: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Sink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.transient {
                if self.permanent {
                    return Err(SinkError::Permanent("bad schema".into()));
                }
                return Err(SinkError::Transient("host down".into()));
            }
            self.rows.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn key() -> TrackedKey {
        TrackedKey::new("X", "trades", "BTC-USD")
    }

    fn setup(sink: Arc<FlakySink>) -> (Arc<CountingQueue>, Aggregator, Config) {
        let cfg = Config::from_json(CONFIG).unwrap();
        let queue = Arc::new(CountingQueue::default());
        let (_tx, rx) = watch::channel(Arc::new(cfg.clone()));
        let agg = Aggregator::new(queue.clone(), Storage::new(vec![sink as Arc<dyn Sink>]), rx);
        (queue, agg, cfg)
    }

    async fn buffer(queue: &CountingQueue, stamps: &[i64]) {
        for ts in stamps {
            let payload = format!(r#"{{"timestamp":{ts},"price":"1.0"}}"#);
            queue.publish(&key(), *ts, &payload).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_single_commit() {
        let sink = FlakySink::new(2);
        let (queue, mut agg, cfg) = setup(sink.clone());
        buffer(&queue, &[100, 101, 102]).await;

        let window = Window::Range { start: 100, end: 103 };
        let outcome = agg
            .flush_key(&key(), window, 0, RetryPolicy::from_config(&cfg), &CancellationToken::new())
            .await;

        assert_eq!(outcome, FlushOutcome::Committed(3));
        assert_eq!(sink.calls(), 3);
        assert_eq!(*queue.commits.lock().unwrap(), vec![3]);
        assert!(queue.read(&key(), window).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_entries_buffered() {
        let sink = FlakySink::new(usize::MAX);
        let (queue, mut agg, cfg) = setup(sink.clone());
        buffer(&queue, &[1, 2, 3]).await;

        let outcome = agg
            .flush_key(&key(), Window::Cursor, 0, RetryPolicy::from_config(&cfg), &CancellationToken::new())
            .await;

        assert_eq!(outcome, FlushOutcome::Failed);
        assert_eq!(sink.calls(), 3);
        assert!(queue.commits.lock().unwrap().is_empty());
        assert_eq!(queue.read(&key(), Window::Cursor).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let sink = FlakySink::broken();
        let (queue, mut agg, cfg) = setup(sink.clone());
        buffer(&queue, &[1]).await;

        let outcome = agg
            .flush_key(&key(), Window::Cursor, 0, RetryPolicy::from_config(&cfg), &CancellationToken::new())
            .await;

        assert_eq!(outcome, FlushOutcome::Failed);
        assert_eq!(sink.calls(), 1);
        assert_eq!(queue.read(&key(), Window::Cursor).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_aborts_without_commit() {
        let sink = FlakySink::new(usize::MAX);
        let (queue, mut agg, _) = setup(sink.clone());
        buffer(&queue, &[1]).await;

        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            attempts: 10,
            wait: Duration::from_secs(3600),
        };

        let trip = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trip.cancel();
        });

        let outcome = agg.flush_key(&key(), Window::Cursor, 0, policy, &cancel).await;
        assert_eq!(outcome, FlushOutcome::Aborted);
        assert_eq!(sink.calls(), 1);
        assert!(queue.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_outage_fails_key_only() {
        let sink = FlakySink::new(0);
        let (queue, mut agg, cfg) = setup(sink.clone());
        queue.fail_reads.store(true, Ordering::SeqCst);

        let report = agg
            .cycle(&cfg, RetryPolicy::from_config(&cfg), &CancellationToken::new())
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn failed_window_is_retried_whole() {
        let sink = FlakySink::new(1);
        let (queue, mut agg, _) = setup(sink.clone());
        buffer(&queue, &[100, 150]).await;

        let first = Window::Range { start: 100, end: 120 };
        let outcome = agg
            .flush_key(&key(), first, 0, RetryPolicy::single(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, FlushOutcome::Failed);
        assert_eq!(agg.progress(&key()), None);

        // next cycle: window starts where the failed one did
        let planned_start = agg.progress(&key()).unwrap_or(100);
        let second = Window::Range { start: planned_start, end: 200 };
        let outcome = agg
            .flush_key(&key(), second, 0, RetryPolicy::single(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, FlushOutcome::Committed(2));
        assert_eq!(agg.progress(&key()), Some(200));
        assert_eq!(*sink.rows.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn truncated_read_is_finished_by_the_next_window() {
        let sink = FlakySink::new(0);
        let (queue, mut agg, _) = setup(sink.clone());
        queue.read_limit.store(2, Ordering::SeqCst);
        buffer(&queue, &[100, 101, 102]).await;

        let first = Window::Range { start: 100, end: 103 };
        let outcome = agg
            .flush_key(&key(), first, 0, RetryPolicy::single(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, FlushOutcome::Committed(2));
        assert_eq!(agg.progress(&key()), Some(103));

        // the entry cut off by the read limit is older than this start
        let second = Window::Range { start: 103, end: 200 };
        let outcome = agg
            .flush_key(&key(), second, 0, RetryPolicy::single(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, FlushOutcome::Committed(1));
        assert_eq!(*sink.rows.lock().unwrap(), vec![2, 1]);
        assert!(queue.read(&key(), Window::Cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backlog_from_before_a_restart_is_flushed() {
        let sink = FlakySink::new(0);
        let (queue, _, cfg) = setup(sink.clone());
        buffer(&queue, &[10, 20, 5_000]).await;

        // fresh aggregator, no progress: first window is the last interval only
        let (_tx, rx) = watch::channel(Arc::new(cfg));
        let mut restarted = Aggregator::new(
            queue.clone(),
            Storage::new(vec![sink.clone() as Arc<dyn Sink>]),
            rx,
        );
        let minutely = Interval::Calendar {
            unit: CalendarUnit::Minute,
            multiplier: 1,
        };
        let window = WindowPlanner::new(minutely).plan(180_000, restarted.progress(&key()));
        assert_eq!(window, Window::Range { start: 120_000, end: 180_000 });

        let outcome = restarted
            .flush_key(&key(), window, 180_000, RetryPolicy::single(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, FlushOutcome::Committed(3));
        assert_eq!(*queue.commits.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn empty_keys_are_skipped() {
        let sink = FlakySink::new(0);
        let (_queue, mut agg, cfg) = setup(sink.clone());

        let report = agg
            .cycle(&cfg, RetryPolicy::from_config(&cfg), &CancellationToken::new())
            .await;
        assert_eq!(report.empty, 1);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_makes_one_attempt() {
        let sink = FlakySink::new(1);
        let (queue, mut agg, cfg) = setup(sink.clone());
        buffer(&queue, &[1, 2]).await;

        let report = agg.drain(&cfg).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(sink.calls(), 1);
        assert_eq!(queue.read(&key(), Window::Cursor).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_after_cancel() {
        let sink = FlakySink::new(0);
        let (queue, agg, _) = setup(sink.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agg.run(cancel.clone()));

        // let the first cycle pass with nothing buffered
        sleep(Duration::from_secs(1)).await;
        buffer(&queue, &[1, 2, 3]).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*queue.commits.lock().unwrap(), vec![3]);
        assert_eq!(*sink.rows.lock().unwrap(), vec![3]);
    }

    #[test]
    fn pacing_floors_overruns() {
        let minute = Duration::from_secs(60);
        assert_eq!(pacing(minute, Duration::from_secs(20)), (Duration::from_secs(40), false));
        assert_eq!(pacing(minute, Duration::from_secs(75)), (MIN_CYCLE_SLEEP, true));
        assert_eq!(pacing(minute, minute), (MIN_CYCLE_SLEEP, true));
    }
}
