use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;
use crate::metrics::METRICS;

use super::{Command, WorkerDescriptor};

/// Creates ingestion workers.
///
/// CONTRACT:
/// - The returned task must finish soon after `cancel` fires
/// - A task that outlives the stop timeout is aborted
pub trait WorkerFactory: Send + Sync {
    fn spawn(&self, worker: WorkerDescriptor, cancel: CancellationToken) -> JoinHandle<()>;
}

struct LiveWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Worker-management task.
///
/// Sole owner of the live-handle map. Commands are applied strictly
/// in arrival order, one at a time.
pub struct Spawner {
    factory: Arc<dyn WorkerFactory>,
    live: HashMap<String, LiveWorker>,
    stop_timeout: Duration,
}

impl Spawner {
    pub fn new(factory: Arc<dyn WorkerFactory>, stop_timeout: Duration) -> Self {
        Self {
            factory,
            live: HashMap::new(),
            stop_timeout,
        }
    }

    /// Consumes commands until `cancel` fires, then stops every worker.
    ///
    /// A closed command channel does not stop the workers: during
    /// shutdown the channel closes first and workers keep publishing
    /// until the final drain has run.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut open = true;

        while open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.apply(cmd).await {
                            log::warn!("{}", e);
                        }
                    }
                    None => {
                        log::debug!("command channel closed, waiting for teardown");
                        open = false;
                    }
                },
            }
        }

        if open {
            commands.close();
        } else {
            cancel.cancelled().await;
        }

        self.stop_all().await;
        log::info!("spawner stopped");
        Ok(())
    }

    pub async fn apply(&mut self, cmd: Command) -> Result<(), SupervisorError> {
        self.reap();

        match cmd {
            Command::Start {
                source,
                subscription_spec,
                config,
            } => {
                if self.live.contains_key(&source) {
                    return Err(SupervisorError::InconsistentSourceState(format!(
                        "start for {source} ignored, worker already running"
                    )));
                }

                log::info!("starting worker {}", source);
                let cancel = CancellationToken::new();
                let handle = self.factory.spawn(
                    WorkerDescriptor {
                        source: source.clone(),
                        spec: subscription_spec,
                        options: config,
                    },
                    cancel.clone(),
                );
                self.live.insert(source, LiveWorker { cancel, handle });
            }

            Command::Stop { source } => {
                if !self.stop(&source).await {
                    log::debug!("stop for {} ignored, no live worker", source);
                }
            }
        }

        METRICS.workers_active.store(self.live.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Forgets workers whose task already ended.
    fn reap(&mut self) {
        self.live.retain(|source, worker| {
            let alive = !worker.handle.is_finished();
            if !alive {
                log::warn!("worker {} exited on its own", source);
            }
            alive
        });
    }

    /// Cancels and joins one worker. Returns false if none was live.
    async fn stop(&mut self, source: &str) -> bool {
        let Some(mut worker) = self.live.remove(source) else {
            return false;
        };

        worker.cancel.cancel();
        match timeout(self.stop_timeout, &mut worker.handle).await {
            Ok(Ok(())) => log::info!("worker {} stopped", source),
            Ok(Err(e)) => log::warn!("worker {} ended abnormally: {}", source, e),
            Err(_) => {
                log::warn!(
                    "worker {} did not stop within {}s, aborting",
                    source,
                    self.stop_timeout.as_secs()
                );
                worker.handle.abort();
            }
        }
        true
    }

    pub async fn stop_all(&mut self) {
        let sources: Vec<String> = self.live_sources().into_iter().map(String::from).collect();
        if !sources.is_empty() {
            log::info!("stopping workers {:?}", sources);
        }

        for source in sources {
            self.stop(&source).await;
        }
        METRICS.workers_active.store(0, Ordering::Relaxed);
    }

    pub fn live_sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = self.live.keys().map(String::as_str).collect();
        sources.sort();
        sources
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{QueueConfig, SubscriptionSpec, WorkerOptions};

    /// Workers that idle until cancelled, optionally ignoring it.
    #[derive(Default)]
    struct FakeFactory {
        stubborn: bool,
        spawned: Mutex<Vec<String>>,
    }

    impl WorkerFactory for FakeFactory {
        fn spawn(&self, worker: WorkerDescriptor, cancel: CancellationToken) -> JoinHandle<()> {
            self.spawned.lock().unwrap().push(worker.source);
            let stubborn = self.stubborn;
            tokio::spawn(async move {
                if stubborn {
                    futures_util::future::pending::<()>().await;
                }
                cancel.cancelled().await;
            })
        }
    }

    fn start(source: &str) -> Command {
        Command::Start {
            source: source.into(),
            subscription_spec: SubscriptionSpec::default(),
            config: WorkerOptions { queue: QueueConfig::memory() },
        }
    }

    fn stop(source: &str) -> Command {
        Command::Stop { source: source.into() }
    }

    #[tokio::test]
    async fn at_most_one_worker_per_source() {
        let factory = Arc::new(FakeFactory::default());
        let mut spawner = Spawner::new(factory.clone(), Duration::from_secs(1));

        spawner.apply(start("A")).await.unwrap();
        let dup = spawner.apply(start("A")).await;
        assert!(matches!(dup, Err(SupervisorError::InconsistentSourceState(_))));
        spawner.apply(start("B")).await.unwrap();
        spawner.apply(stop("A")).await.unwrap();
        spawner.apply(start("A")).await.unwrap();

        assert_eq!(spawner.live_sources(), vec!["A", "B"]);
        assert_eq!(factory.spawned.lock().unwrap().len(), 3);
        spawner.stop_all().await;
        assert!(spawner.live_sources().is_empty());
    }

    #[tokio::test]
    async fn crashed_worker_can_be_restarted() {
        struct Crashing;
        impl WorkerFactory for Crashing {
            fn spawn(&self, _w: WorkerDescriptor, _c: CancellationToken) -> JoinHandle<()> {
                tokio::spawn(async {})
            }
        }

        let mut spawner = Spawner::new(Arc::new(Crashing), Duration::from_secs(1));
        spawner.apply(start("A")).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(spawner.apply(start("A")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_worker_is_aborted() {
        let factory = Arc::new(FakeFactory {
            stubborn: true,
            ..Default::default()
        });
        let mut spawner = Spawner::new(factory, Duration::from_secs(5));

        spawner.apply(start("A")).await.unwrap();
        let started = tokio::time::Instant::now();
        spawner.apply(stop("A")).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(spawner.live_sources().is_empty());
    }

    #[tokio::test]
    async fn closed_channel_keeps_workers_until_cancel() {
        let factory = Arc::new(FakeFactory::default());
        let spawner = Spawner::new(factory.clone(), Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(spawner.run(rx, cancel.clone()));

        tx.send(start("A")).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*factory.spawned.lock().unwrap(), vec!["A"]);
    }
}
