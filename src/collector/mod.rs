/// Collector module
///
/// Ingestion workers: exchange WebSocket connections that publish
/// parsed market events into the durable queue.
///
/// The collector layer sits between:
/// - Exchange adapters (Coinbase, Binance)
/// - The durable queue the aggregator drains
///
/// Exchange-specific logic MUST NOT live here.
pub mod runner;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::exchanges::get_adapter;
use crate::supervisor::WorkerDescriptor;
use crate::supervisor::spawner::WorkerFactory;

/// Starts real exchange collectors for supervisor commands.
pub struct CollectorFactory;

impl WorkerFactory for CollectorFactory {
    fn spawn(&self, worker: WorkerDescriptor, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(adapter) = get_adapter(&worker.source) else {
                log::error!("Exchange '{}' is not supported", worker.source);
                return;
            };

            let source = worker.source.clone();
            if let Err(e) = runner::run_source(adapter, worker, cancel).await {
                log::error!("{}: worker failed: {:#}", source, e);
            }
        })
    }
}
