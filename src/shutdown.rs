use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One long-running task and the token that stops it.
pub struct Unit {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Unit {
    pub fn new(
        name: &'static str,
        cancel: CancellationToken,
        handle: JoinHandle<anyhow::Result<()>>,
    ) -> Self {
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    /// Waits for the task to return. Cancel safe; a second call after
    /// completion returns immediately.
    async fn join(&mut self) -> anyhow::Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let joined = handle.await;
        self.handle = None;

        joined
            .with_context(|| format!("{} task panicked", self.name))?
            .with_context(|| format!("{} task failed", self.name))
    }

    /// Cancels the task and waits for it to return.
    async fn stop(mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.join().await?;
        log::info!("{} stopped", self.name);
        Ok(())
    }
}

/// Ordered teardown of the pipeline.
///
/// ORDER:
/// 1. supervisor: closes the command channel
/// 2. aggregator: final drain pass, if configured
/// 3. spawner: stops and joins every worker
/// 4. background: everything else (watcher, metrics)
///
/// Workers keep publishing until step 3, so nothing they buffered
/// before the signal is missed by the drain.
pub struct Coordinator {
    pub supervisor: Unit,
    pub aggregator: Unit,
    pub spawner: Unit,
    pub background: CancellationToken,
}

impl Coordinator {
    /// Waits for a termination signal, then tears down.
    ///
    /// The aggregator returning on its own is treated like a signal,
    /// and its error becomes the process result.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut crashed = None;

        tokio::select! {
            signal = wait_for_signal() => {
                log::info!("received {}, shutting down", signal?);
            }
            joined = self.aggregator.join() => {
                let e = joined.err().unwrap_or_else(|| anyhow::anyhow!("aggregator exited unexpectedly"));
                log::error!("{:#}, shutting down", e);
                crashed = Some(e);
            }
        }

        // repeat signals are only logged
        tokio::spawn(async {
            while let Ok(signal) = wait_for_signal().await {
                log::warn!("received {} while already shutting down, ignoring", signal);
            }
        });

        let result = self.teardown().await;
        match crashed {
            Some(e) => Err(e),
            None => result,
        }
    }

    pub async fn teardown(self) -> anyhow::Result<()> {
        let mut first_error = None;

        for unit in [self.supervisor, self.aggregator, self.spawner] {
            if let Err(e) = unit.stop().await {
                log::error!("{:#}", e);
                first_error.get_or_insert(e);
            }
        }

        self.background.cancel();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sighup.recv() => Ok("SIGHUP"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    Ok("ctrl-c")
}
