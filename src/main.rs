// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Configuration snapshot loaded from JSON
// - schema:     Tracked keys, queue entries, windows, market messages
// - window:     Aggregation window planning
// - queue:      Durable queue contract and backends
// - sink:       Storage sinks and fan-out
// - aggregator: Drain loop (read → write → commit)
// - supervisor: Reconciliation, command channel, worker management
// - collector:  Ingestion workers (exchange WebSocket runtime)
// - exchanges:  Exchange adapters and adapter registry
// - watcher:    Config file polling
// - shutdown:   Signal handling and ordered teardown
//
mod aggregator;
mod collector;
mod config;
mod error;
mod exchanges;
mod metrics;
mod queue;
mod schema;
mod shutdown;
mod sink;
mod supervisor;
mod util;
mod watcher;
mod window;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::crypto::{CryptoProvider, ring};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use aggregator::Aggregator;
use collector::CollectorFactory;
use config::Config;
use metrics::METRICS;
use shutdown::{Coordinator, Unit};
use sink::Storage;
use supervisor::Supervisor;
use supervisor::spawner::Spawner;
use watcher::ConfigWatcher;

/// Pending start/stop commands between supervisor and spawner.
const COMMAND_BUFFER: usize = 64;

const METRICS_EVERY: Duration = Duration::from_secs(10);

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls) and logging
// - Load and validate configuration
// - Open the durable queue and storage sinks
// - Start watcher, supervisor, spawner and aggregator tasks
// - Hand over to the shutdown coordinator
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // rustls >= 0.23 requires an explicit CryptoProvider,
    // installed exactly once before any TLS connection.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // Configuration
    // --------------------------------------------------------
    let path = Config::default_path();
    let config = Arc::new(
        Config::load(&path).with_context(|| format!("loading {}", path.display()))?,
    );
    log::info!(
        "loaded {} ({} sources, {} tracked keys)",
        path.display(),
        config.sources.len(),
        config.tracked_keys().len()
    );

    // --------------------------------------------------------
    // Durable queue + storage
    // --------------------------------------------------------
    let queue = queue::open(&config.queue).context("opening durable queue")?;
    if config.queue.start_flush {
        queue.flush_all().await.context("flushing queue at startup")?;
        log::info!("{} queue flushed", queue.name());
    }

    let storage = Storage::from_config(&config.storage)
        .await
        .context("building storage sinks")?;

    // --------------------------------------------------------
    // Background tasks: metrics reporter, config watcher
    // --------------------------------------------------------
    let background = CancellationToken::new();

    let reporter = background.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reporter.cancelled() => break,
                _ = sleep(METRICS_EVERY) => log::info!("[METRICS] {}", METRICS.summary()),
            }
        }
    });

    let (watcher, config_rx) = ConfigWatcher::new(path, config.clone());
    let watch_cancel = background.child_token();
    tokio::spawn(async move {
        if let Err(e) = watcher.run(watch_cancel).await {
            log::error!("config watcher failed: {:#}", e);
        }
    });

    // --------------------------------------------------------
    // Supervisor → command channel → spawner
    // --------------------------------------------------------
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let spawner_cancel = CancellationToken::new();
    let spawner = Spawner::new(Arc::new(CollectorFactory), config.worker_stop_timeout());
    let spawner_task = tokio::spawn(spawner.run(cmd_rx, spawner_cancel.clone()));

    let supervisor_cancel = CancellationToken::new();
    let supervisor_task = tokio::spawn(
        Supervisor::new(cmd_tx).run(config_rx.clone(), supervisor_cancel.clone()),
    );

    // --------------------------------------------------------
    // Aggregator
    // --------------------------------------------------------
    let aggregator_cancel = CancellationToken::new();
    let aggregator_task = tokio::spawn(
        Aggregator::new(queue, storage, config_rx).run(aggregator_cancel.clone()),
    );

    // --------------------------------------------------------
    // Run until a termination signal, then tear down in order
    // --------------------------------------------------------
    Coordinator {
        supervisor: Unit::new("supervisor", supervisor_cancel, supervisor_task),
        aggregator: Unit::new("aggregator", aggregator_cancel, aggregator_task),
        spawner: Unit::new("spawner", spawner_cancel, spawner_task),
        background,
    }
    .run()
    .await?;

    log::info!("tickstore stopped");
    Ok(())
}
