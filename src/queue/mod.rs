//! Durable queue registry and contract
//!
//! This module provides:
//! - The `DurableQueue` trait every backend implements
//! - A factory resolving the configured backend
//!
//! Reads are non-destructive. Only `commit` makes entries
//! unavailable to later reads, which is what lets the aggregator
//! crash between read and commit without losing data.

pub mod group;
pub mod memory;
mod link;
pub mod stream;

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::QueueError;
use crate::schema::{QueueEntry, SequenceToken, TrackedKey, Window};

/// At-least-once buffer between ingestion workers and sinks.
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One instance is shared for reads and commits; backends
///   guarantee atomic cursor / offset advancement themselves
///
#[async_trait::async_trait]
pub trait DurableQueue: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Appends one event under `key`.
    ///
    /// `timestamp` is the event time in milliseconds. Backends with
    /// their own insertion clock may use that instead for ordering.
    async fn publish(
        &self,
        key: &TrackedKey,
        timestamp: i64,
        payload: &str,
    ) -> Result<SequenceToken, QueueError>;

    /// Uncommitted entries for `key`, oldest first.
    ///
    /// With `Window::Range` only entries whose timestamp falls in
    /// `[start, end)` come back.
    async fn read(&self, key: &TrackedKey, window: Window) -> Result<Vec<QueueEntry>, QueueError>;

    /// Marks `entries` (as returned by `read`) consumed.
    async fn commit(&self, key: &TrackedKey, entries: &[QueueEntry]) -> Result<(), QueueError>;

    /// Drops everything the backend holds.
    async fn flush_all(&self) -> Result<(), QueueError>;
}

/// Process-wide instance behind the `memory` backend, so workers
/// and the aggregator running as tasks see the same buffer.
static SHARED_MEMORY: Lazy<Arc<memory::MemoryQueue>> =
    Lazy::new(|| Arc::new(memory::MemoryQueue::new()));

/// Resolves the queue backend named in configuration.
///
/// Connections are established lazily, so this never touches the
/// network; an unreachable backend surfaces as `QueueUnavailable`
/// on first use.
pub fn open(cfg: &QueueConfig) -> Result<Arc<dyn DurableQueue>, QueueError> {
    match cfg.backend {
        QueueBackend::Redis => Ok(Arc::new(stream::RedisStreamQueue::new(cfg)?)),
        QueueBackend::RedisGroup => Ok(Arc::new(group::RedisGroupQueue::new(cfg)?)),
        QueueBackend::Memory => Ok(SHARED_MEMORY.clone()),
    }
}
