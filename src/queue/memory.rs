use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::QueueError;
use crate::schema::{QueueEntry, SequenceToken, TrackedKey, Window};
use crate::util;

use super::DurableQueue;

/// In-process queue.
///
/// Used for dry runs and tests. Entries live in an ordered map per
/// key; commit removes them, so there is no separate cursor.
#[derive(Default)]
pub struct MemoryQueue {
    streams: Mutex<HashMap<String, Stream>>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<SequenceToken, (i64, String)>,
    last: Option<SequenceToken>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently buffered for `key`.
    #[cfg(test)]
    pub fn len(&self, key: &TrackedKey) -> usize {
        self.lock()
            .map(|s| s.get(&key.to_string()).map_or(0, |st| st.entries.len()))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Stream>>, QueueError> {
        self.streams
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl DurableQueue for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(
        &self,
        key: &TrackedKey,
        timestamp: i64,
        payload: &str,
    ) -> Result<SequenceToken, QueueError> {
        let mut streams = self.lock()?;
        let stream = streams.entry(key.to_string()).or_default();

        // same rule as Redis auto ids: wall clock, never going backwards
        let now = SequenceToken::new(util::now_ms().max(0) as u64, 0);
        let token = match stream.last {
            Some(last) if last >= now => last.next(),
            _ => now,
        };

        stream.entries.insert(token, (timestamp, payload.to_string()));
        stream.last = Some(token);
        Ok(token)
    }

    async fn read(&self, key: &TrackedKey, window: Window) -> Result<Vec<QueueEntry>, QueueError> {
        let streams = self.lock()?;
        let Some(stream) = streams.get(&key.to_string()) else {
            return Ok(Vec::new());
        };

        Ok(stream
            .entries
            .iter()
            .filter(|(_, (ts, _))| window.admits(*ts))
            .map(|(token, (ts, payload))| QueueEntry {
                token: *token,
                timestamp: *ts,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn commit(&self, key: &TrackedKey, entries: &[QueueEntry]) -> Result<(), QueueError> {
        let mut streams = self.lock()?;
        if let Some(stream) = streams.get_mut(&key.to_string()) {
            for entry in entries {
                stream.entries.remove(&entry.token);
            }
        }
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), QueueError> {
        self.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TrackedKey {
        TrackedKey::new("X", "trades", "BTC-USD")
    }

    #[tokio::test]
    async fn read_is_non_destructive() {
        let q = MemoryQueue::new();
        for ts in [100, 101, 102] {
            q.publish(&key(), ts, "{}").await.unwrap();
        }

        let first = q.read(&key(), Window::Cursor).await.unwrap();
        let second = q.read(&key(), Window::Cursor).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn committed_entries_never_come_back() {
        let q = MemoryQueue::new();
        for ts in [100, 101, 102] {
            q.publish(&key(), ts, "{}").await.unwrap();
        }

        let entries = q.read(&key(), Window::Cursor).await.unwrap();
        q.commit(&key(), &entries[..2]).await.unwrap();

        let rest = q.read(&key(), Window::Cursor).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp, 102);
    }

    #[tokio::test]
    async fn tokens_strictly_increase() {
        let q = MemoryQueue::new();
        let mut tokens = Vec::new();
        for ts in 0..50 {
            tokens.push(q.publish(&key(), ts, "{}").await.unwrap());
        }
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn window_read_stops_at_end() {
        let q = MemoryQueue::new();
        for ts in [99, 100, 101, 102, 103] {
            q.publish(&key(), ts, &ts.to_string()).await.unwrap();
        }

        let got = q
            .read(&key(), Window::Range { start: 100, end: 103 })
            .await
            .unwrap();
        let stamps: Vec<i64> = got.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![99, 100, 101, 102]);
    }

    #[tokio::test]
    async fn late_event_joins_the_next_window() {
        let q = MemoryQueue::new();
        q.publish(&key(), 30_000, "on time").await.unwrap();

        let first = q
            .read(&key(), Window::Range { start: 0, end: 60_000 })
            .await
            .unwrap();
        q.commit(&key(), &first).await.unwrap();

        // stamped before the boundary, published after it was read
        q.publish(&key(), 59_990, "late").await.unwrap();

        let next = q
            .read(&key(), Window::Range { start: 60_000, end: 120_000 })
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, "late");

        q.commit(&key(), &next).await.unwrap();
        assert_eq!(q.len(&key()), 0);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let q = MemoryQueue::new();
        let other = TrackedKey::new("X", "trades", "ETH-USD");
        q.publish(&key(), 1, "a").await.unwrap();
        q.publish(&other, 1, "b").await.unwrap();

        let entries = q.read(&key(), Window::Cursor).await.unwrap();
        q.commit(&key(), &entries).await.unwrap();

        assert_eq!(q.len(&key()), 0);
        assert_eq!(q.len(&other), 1);
    }
}
