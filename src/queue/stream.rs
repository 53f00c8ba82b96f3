use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::schema::{QueueEntry, SequenceToken, TrackedKey, Window};
use crate::util;

use super::DurableQueue;
use super::link::{self, DATA_FIELD, RawEntry, RedisLink};

/// ============================================================
/// RedisStreamQueue
/// ============================================================
///
/// Cursor log on Redis Streams, one stream per tracked key.
///
/// - read:   XRANGE from the committed cursor (exclusive) up to the
///           window end, paged by `read_count`
/// - commit: advance the cursor, then XDEL the entries, or with a
///           retention horizon XTRIM MINID up to whichever is older:
///           the horizon or the cursor
///
/// The cursor lives in this process. After a restart reads start
/// from the oldest retained entry again, which only ever causes
/// replay, never loss.
pub struct RedisStreamQueue {
    link: RedisLink,
    cursors: Mutex<HashMap<String, SequenceToken>>,
    retention: Option<Duration>,
    del_after_read: bool,
    read_count: usize,
}

impl RedisStreamQueue {
    pub fn new(cfg: &QueueConfig) -> Result<Self, QueueError> {
        Ok(Self {
            link: RedisLink::open(&cfg.url)?,
            cursors: Mutex::new(HashMap::new()),
            retention: cfg.retention_secs.map(Duration::from_secs),
            del_after_read: cfg.del_after_read,
            read_count: cfg.read_count.max(1),
        })
    }

    fn cursor(&self, key: &str) -> Result<Option<SequenceToken>, QueueError> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| QueueError::Unavailable("cursor lock poisoned".into()))?;
        Ok(cursors.get(key).copied())
    }

    fn advance(&self, key: &str, to: SequenceToken) -> Result<(), QueueError> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| QueueError::Unavailable("cursor lock poisoned".into()))?;
        let slot = cursors.entry(key.to_string()).or_insert(to);
        if to > *slot {
            *slot = to;
        }
        Ok(())
    }
}

/// XRANGE bounds for a read, or `None` when nothing can match.
///
/// The lower bound is always the committed cursor (exclusive), or the
/// oldest entry when nothing was committed yet, so uncommitted
/// entries older than a window's start are read with it. Range ends
/// are inclusive in Redis, so `end` becomes `end-1` where a bare
/// millisecond id covers every sequence number within it.
pub fn range_bounds(window: Window, cursor: Option<SequenceToken>) -> Option<(String, String)> {
    let lower = cursor.map_or_else(|| "-".to_string(), |c| format!("({c}"));

    match window {
        Window::Cursor => Some((lower, "+".into())),
        Window::Range { end, .. } => {
            if window.is_empty() || end <= 0 {
                return None;
            }
            Some((lower, (end - 1).to_string()))
        }
    }
}

/// MINID for a retention-bounded trim: entries below both the
/// retention cutoff and the committed cursor go away.
pub fn trim_floor(now_ms: i64, retention: Duration, committed: SequenceToken) -> SequenceToken {
    let cutoff_ms = (now_ms - retention.as_millis() as i64).max(0) as u64;
    SequenceToken::new(cutoff_ms, 0).min(committed.next())
}

#[async_trait::async_trait]
impl DurableQueue for RedisStreamQueue {
    fn name(&self) -> &'static str {
        "redis"
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
        let stream = key.to_string();
        let Some((lower, upper)) = range_bounds(window, self.cursor(&stream)?) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut lower = Some(lower);
        while let Some(from) = lower.take() {
            let raw: Vec<RawEntry> = self
                .link
                .query(
                    redis::cmd("XRANGE")
                        .arg(&stream)
                        .arg(&from)
                        .arg(&upper)
                        .arg("COUNT")
                        .arg(self.read_count),
                )
                .await?;
            let page = link::decode_entries(raw)?;

            // cursor reads have no fixed end; one page per cycle
            if matches!(window, Window::Range { .. }) {
                lower = link::resume_after(&page, self.read_count).map(|t| format!("({t}"));
            }
            entries.extend(page);
        }

        if !entries.is_empty() {
            log::info!("{}: read {} entries from redis", stream, entries.len());
        }
        Ok(entries)
    }

    async fn commit(&self, key: &TrackedKey, entries: &[QueueEntry]) -> Result<(), QueueError> {
        let Some(last) = entries.iter().map(|e| e.token).max() else {
            return Ok(());
        };
        let stream = key.to_string();

        match self.retention {
            Some(retention) => {
                let floor = trim_floor(util::now_ms(), retention, last);
                let trimmed: usize = self
                    .link
                    .query(
                        redis::cmd("XTRIM")
                            .arg(&stream)
                            .arg("MINID")
                            .arg(floor.to_string()),
                    )
                    .await?;
                log::debug!("{}: trimmed {} entries below {}", stream, trimmed, floor);
            }
            None if self.del_after_read => {
                let mut cmd = redis::cmd("XDEL");
                cmd.arg(&stream);
                for entry in entries {
                    cmd.arg(entry.token.to_string());
                }
                let _: usize = self.link.query(&cmd).await?;
            }
            None => {}
        }

        // cursor only moves once the backend accepted the commit
        self.advance(&stream, last)?;
        log::info!("{}: removed through id {}", stream, last);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), QueueError> {
        log::info!("flushing redis cache");
        let _: () = self.link.query(&redis::cmd("FLUSHALL")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_reads_resume_after_commit() {
        assert_eq!(
            range_bounds(Window::Cursor, None),
            Some(("-".to_string(), "+".to_string()))
        );
        assert_eq!(
            range_bounds(Window::Cursor, Some(SequenceToken::new(17, 2))),
            Some(("(17-2".to_string(), "+".to_string()))
        );
    }

    #[test]
    fn window_reads_start_at_the_cursor() {
        let w = Window::Range { start: 200, end: 300 };

        // nothing committed yet: the whole retained backlog
        assert_eq!(
            range_bounds(w, None),
            Some(("-".to_string(), "299".to_string()))
        );

        // cursor before the window start: stragglers 151..199 included
        assert_eq!(
            range_bounds(w, Some(SequenceToken::new(150, 0))),
            Some(("(150-0".to_string(), "299".to_string()))
        );

        // committed part of the window is skipped
        assert_eq!(
            range_bounds(w, Some(SequenceToken::new(250, 1))),
            Some(("(250-1".to_string(), "299".to_string()))
        );

        assert_eq!(range_bounds(Window::Range { start: 7, end: 7 }, None), None);
    }

    #[test]
    fn trim_never_passes_the_cursor() {
        let hour = Duration::from_secs(3_600);
        let now = 10_000_000;

        // cursor far behind the horizon: trim stops at the cursor
        assert_eq!(
            trim_floor(now, hour, SequenceToken::new(1_000, 4)),
            SequenceToken::new(1_000, 5)
        );

        // cursor ahead: younger-than-retention entries survive
        assert_eq!(
            trim_floor(now, hour, SequenceToken::new(9_999_000, 0)),
            SequenceToken::new(6_400_000, 0)
        );
    }
}
