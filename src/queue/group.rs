use std::collections::HashSet;

use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::schema::{QueueEntry, SequenceToken, TrackedKey, Window};

use super::DurableQueue;
use super::link::{self, DATA_FIELD, RawEntry, RedisLink};

/// XREADGROUP reply: `[[stream, [entry, ...]], ...]`, nil when empty.
type GroupReply = Option<Vec<(String, Vec<RawEntry>)>>;

/// ============================================================
/// RedisGroupQueue
/// ============================================================
///
/// Consumer-group log on Redis Streams.
///
/// Offsets are tracked server side: delivered-but-unacknowledged
/// entries sit in this consumer's pending list and are replayed
/// (id "0") before anything new (id ">") is fetched. Both are paged
/// by `read_count`. Commit is XACK, which is what advances the durable
/// offset.
pub struct RedisGroupQueue {
    link: RedisLink,
    group: String,
    consumer: String,
    del_after_read: bool,
    read_count: usize,

    /// Streams whose group is known to exist.
    ready: Mutex<HashSet<String>>,
}

impl RedisGroupQueue {
    pub fn new(cfg: &QueueConfig) -> Result<Self, QueueError> {
        Ok(Self {
            link: RedisLink::open(&cfg.url)?,
            group: cfg.group.clone(),
            consumer: format!("{}-aggregator", cfg.group),
            del_after_read: cfg.del_after_read,
            read_count: cfg.read_count.max(1),
            ready: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_group(&self, stream: &str) -> Result<(), QueueError> {
        if self.ready.lock().await.contains(stream) {
            return Ok(());
        }

        let created: Result<(), QueueError> = self
            .link
            .query(
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(&self.group)
                    .arg("0")
                    .arg("MKSTREAM"),
            )
            .await;

        match created {
            Ok(()) => log::info!("{}: created consumer group {}", stream, self.group),
            Err(QueueError::Unavailable(msg)) if msg.contains("BUSYGROUP") => {}
            Err(e) => return Err(e),
        }

        self.ready.lock().await.insert(stream.to_string());
        Ok(())
    }

    async fn read_from(&self, stream: &str, id: &str) -> Result<Vec<QueueEntry>, QueueError> {
        let reply: GroupReply = self
            .link
            .query(
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(&self.group)
                    .arg(&self.consumer)
                    .arg("COUNT")
                    .arg(self.read_count)
                    .arg("STREAMS")
                    .arg(stream)
                    .arg(id),
            )
            .await?;

        let raw = reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .collect();
        link::decode_entries(raw)
    }
}

#[async_trait::async_trait]
impl DurableQueue for RedisGroupQueue {
    fn name(&self) -> &'static str {
        "redis-group"
    }

    async fn publish(
        &self,
        key: &TrackedKey,
        _timestamp: i64,
        payload: &str,
    ) -> Result<SequenceToken, QueueError> {
        let id: String = self
            .link
            .query(
                redis::cmd("XADD")
                    .arg(key.to_string())
                    .arg("*")
                    .arg(DATA_FIELD)
                    .arg(payload),
            )
            .await?;
        id.parse().map_err(QueueError::Malformed)
    }

    async fn read(&self, key: &TrackedKey, window: Window) -> Result<Vec<QueueEntry>, QueueError> {
        if window.is_empty() {
            return Ok(Vec::new());
        }

        let stream = key.to_string();
        self.ensure_group(&stream).await?;

        // pending list first, then anything never delivered
        let mut entries = Vec::new();
        let mut from = Some(SequenceToken::new(0, 0));
        while let Some(after) = from.take() {
            let page = self.read_from(&stream, &after.to_string()).await?;
            from = link::resume_after(&page, self.read_count);
            entries.extend(page);
        }

        loop {
            let page = self.read_from(&stream, ">").await?;
            let more = link::resume_after(&page, self.read_count).is_some()
                && page.last().is_some_and(|e| window.admits(e.timestamp))
                && matches!(window, Window::Range { .. });
            entries.extend(page);
            if !more {
                break;
            }
        }

        // entries at or past the window end stay pending for a later read;
        // older pending entries are flushed with this window
        entries.retain(|e| window.admits(e.timestamp));

        if !entries.is_empty() {
            log::info!("{}: read {} entries via group {}", stream, entries.len(), self.group);
        }
        Ok(entries)
    }

    async fn commit(&self, key: &TrackedKey, entries: &[QueueEntry]) -> Result<(), QueueError> {
        if entries.is_empty() {
            return Ok(());
        }
        let stream = key.to_string();

        let mut ack = redis::cmd("XACK");
        ack.arg(&stream).arg(&self.group);
        for entry in entries {
            ack.arg(entry.token.to_string());
        }
        let acked: usize = self.link.query(&ack).await?;

        if self.del_after_read {
            let mut del = redis::cmd("XDEL");
            del.arg(&stream);
            for entry in entries {
                del.arg(entry.token.to_string());
            }
            let _: usize = self.link.query(&del).await?;
        }

        log::info!("{}: acknowledged {} entries", stream, acked);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), QueueError> {
        log::info!("flushing redis cache");
        let _: () = self.link.query(&redis::cmd("FLUSHALL")).await?;
        self.ready.lock().await.clear();
        Ok(())
    }
}
