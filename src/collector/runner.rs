use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, tungstenite::Utf8Bytes};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ChannelSpec,
    exchanges::adapter::{ChannelType, ExchangeAdapter},
    metrics::METRICS,
    queue::{self, DurableQueue},
    schema::TrackedKey,
    supervisor::WorkerDescriptor,
};

/// Base reconnect delay; up to one second of jitter is added.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Consecutive connection failures tolerated when the source sets
/// no `retries`.
const DEFAULT_RETRIES: u32 = 10;

/// Upper bound on the close handshake after cancellation.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs one ingestion worker until cancelled.
///
/// One WebSocket connection per record kind, covering all of that
/// kind's instruments. Every parsed event is published into the
/// durable queue under (source, kind, instrument).
///
/// Connections live in a `JoinSet`, so aborting the worker task
/// tears them down with it.
///
/// A kind the adapter has no channel for is skipped with a warning.
pub async fn run_source(
    adapter: Arc<dyn ExchangeAdapter>,
    worker: WorkerDescriptor,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let queue = queue::open(&worker.options.queue)?;
    let retries = worker.spec.retries.unwrap_or(DEFAULT_RETRIES);
    let mut connections = JoinSet::new();

    for (kind, channel_spec) in &worker.spec.channels {
        let Some(channel) = ChannelType::from_kind(kind) else {
            log::warn!("{}: unsupported channel {}, skipping", worker.source, kind);
            continue;
        };

        let idle = worker.spec.channel_timeout(kind);
        log::info!(
            "{}: spawning {} connection for {} instruments (idle timeout {})",
            worker.source,
            channel.kind(),
            channel_spec.symbols().len(),
            idle.map_or_else(|| "none".to_string(), |d| format!("{}s", d.as_secs()))
        );

        connections.spawn(run_ws_loop(
            adapter.clone(),
            worker.source.clone(),
            channel,
            channel_spec.clone(),
            queue.clone(),
            Limits { retries, idle },
            cancel.clone(),
        ));
    }

    join_connections(&worker.source, connections).await;

    log::info!("{}: worker stopped", worker.source);
    Ok(())
}

/// Waits for every connection task of one worker.
async fn join_connections(source: &str, mut connections: JoinSet<()>) {
    while let Some(result) = connections.join_next().await {
        if let Err(e) = result {
            log::error!("{}: connection task failed: {}", source, e);
        }
    }
}

/// Per-connection failure handling.
#[derive(Debug, Clone, Copy)]
struct Limits {
    /// Consecutive failures before giving up
    retries: u32,

    /// Longest gap between frames before reconnecting
    idle: Option<Duration>,
}

/// Resolves after `idle`, or never.
async fn idle_timer(idle: Option<Duration>) {
    match idle {
        Some(d) => sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Persistent WebSocket connection for one channel.
///
/// Reconnects with jittered delay after any failure (including no
/// frame within the idle timeout) and gives up after `retries`
/// consecutive failures. A connection that delivered data resets the
/// failure count.
async fn run_ws_loop(
    adapter: Arc<dyn ExchangeAdapter>,
    source: String,
    channel: ChannelType,
    spec: ChannelSpec,
    queue: Arc<dyn DurableQueue>,
    limits: Limits,
    cancel: CancellationToken,
) {
    let kind = channel.kind();
    let mut failures = 0u32;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            res = connect_async(adapter.ws_url()) => res,
        };

        match connected {
            Ok((ws, _)) => {
                let (mut write, mut read) = ws.split();

                let sub = adapter.build_subscribe_message(channel, spec.symbols(), &spec);
                if let Err(e) = write.send(Message::Text(Utf8Bytes::from(sub.to_string()))).await {
                    log::warn!("{} {}: subscribe failed: {}", source, kind, e);
                } else {
                    loop {
                        let frame = tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = timeout(CLOSE_TIMEOUT, write.close()).await;
                                return;
                            }
                            frame = read.next() => frame,
                            _ = idle_timer(limits.idle) => {
                                log::warn!("{} {}: no data within idle timeout, reconnecting", source, kind);
                                break;
                            }
                        };

                        match frame {
                            Some(Ok(Message::Text(text))) => {
                                let published = tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    ok = publish(adapter.as_ref(), &source, queue.as_ref(), &text) => ok,
                                };
                                if published {
                                    failures = 0;
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::warn!("{} {}: read error: {}", source, kind, e);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("{} {}: connect failed: {}", source, kind, e);
            }
        }

        failures += 1;
        if failures > limits.retries {
            log::error!(
                "{} {}: giving up after {} consecutive failures",
                source,
                kind,
                failures
            );
            return;
        }

        METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
        let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RECONNECT_DELAY + jitter) => {}
        }
    }
}

/// Parses one frame and appends it to the queue. Returns true if an
/// event was published.
async fn publish(adapter: &dyn ExchangeAdapter, source: &str, queue: &dyn DurableQueue, raw: &str) -> bool {
    let Some(msg) = adapter.parse_message(raw) else {
        return false;
    };

    let payload = match serde_json::to_string(&msg) {
        Ok(p) => p,
        Err(e) => {
            METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("{}: could not encode event: {}", source, e);
            return false;
        }
    };

    let key = TrackedKey::new(source, msg.kind(), msg.symbol());
    match queue.publish(&key, msg.timestamp(), &payload).await {
        Ok(_) => {
            METRICS.events_published.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) => {
            log::warn!("{}: publish failed: {}", key, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::get_adapter;
    use crate::queue::memory::MemoryQueue;
    use crate::schema::Window;

    #[tokio::test]
    async fn parsed_frames_land_under_their_key() {
        let adapter = get_adapter("coinbase").unwrap();
        let queue = MemoryQueue::new();
        let raw = r#"{"type":"match","trade_id":1,"product_id":"BTC-USD","price":"1",
                      "size":"2","side":"buy","time":"2024-03-10T00:00:00Z"}"#;

        assert!(publish(adapter.as_ref(), "coinbase", &queue, raw).await);
        assert!(!publish(adapter.as_ref(), "coinbase", &queue, r#"{"type":"heartbeat"}"#).await);

        let key = TrackedKey::new("coinbase", "trades", "BTC-USD");
        let entries = queue.read(&key, Window::Cursor).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 1_710_028_800_000);
        assert!(entries[0].payload.contains("\"type\":\"trade\""));
    }

    /// Flips its flag when dropped.
    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn aborting_the_worker_stops_its_connections() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut connections = JoinSet::new();
        let flag = DropFlag(dropped.clone());
        connections.spawn(async move {
            // ignores cancellation entirely
            let _flag = flag;
            std::future::pending::<()>().await;
        });

        let worker = tokio::spawn(async move { join_connections("X", connections).await });
        tokio::task::yield_now().await;
        assert!(!dropped.load(Ordering::SeqCst));

        worker.abort();
        assert!(worker.await.unwrap_err().is_cancelled());

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_fires_only_when_set() {
        assert!(timeout(Duration::from_secs(5), idle_timer(Some(Duration::from_secs(3))))
            .await
            .is_ok());
        assert!(timeout(Duration::from_secs(3_600), idle_timer(None)).await.is_err());
    }
}
