use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue};
use tokio::sync::Mutex;

use crate::error::QueueError;
use crate::schema::{QueueEntry, SequenceToken};

/// Field holding the serialized event inside each stream entry.
pub const DATA_FIELD: &str = "data";

/// Raw stream entry as returned by XRANGE / XREADGROUP:
/// `[id, [field, value, field, value, ...]]`
pub type RawEntry = (String, Vec<String>);

/// Lazily (re)connected Redis connection shared by both stream
/// backends.
///
/// A failed command drops the cached connection so the next call
/// reconnects; callers see `QueueUnavailable` in between.
pub struct RedisLink {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisLink {
    pub fn open(url: &str) -> Result<Self, QueueError> {
        let client = Client::open(url)
            .map_err(|e| QueueError::Unavailable(format!("bad redis url {url:?}: {e}")))?;

        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, QueueError> {
        let mut conn = self.connection().await?;
        match cmd.query_async(&mut conn).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    log::warn!("redis connection lost: {}", e);
                    self.conn.lock().await.take();
                }
                Err(e.into())
            }
        }
    }
}

/// Decodes raw stream entries. The entry timestamp is the id's
/// millisecond part, i.e. the Redis insertion clock.
pub fn decode_entries(raw: Vec<RawEntry>) -> Result<Vec<QueueEntry>, QueueError> {
    raw.into_iter()
        .map(|(id, fields)| {
            let token: SequenceToken = id.parse().map_err(QueueError::Malformed)?;
            let payload = fields
                .chunks(2)
                .find(|kv| kv[0] == DATA_FIELD)
                .and_then(|kv| kv.get(1))
                .cloned()
                .ok_or_else(|| QueueError::Malformed(format!("entry {id} has no data field")))?;

            Ok(QueueEntry {
                token,
                timestamp: token.ms as i64,
                payload,
            })
        })
        .collect()
}

/// Last token of a full page, where the next page resumes. `None`
/// once a page comes back short.
pub fn resume_after(page: &[QueueEntry], read_count: usize) -> Option<SequenceToken> {
    if page.len() < read_count {
        return None;
    }
    page.last().map(|e| e.token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_field_pairs() {
        let raw = vec![
            ("1700000000000-0".to_string(), vec!["data".into(), "{\"a\":1}".into()]),
            (
                "1700000000000-1".to_string(),
                vec!["src".into(), "x".into(), "data".into(), "{}".into()],
            ),
        ];

        let entries = decode_entries(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, "{\"a\":1}");
        assert_eq!(entries[1].token, SequenceToken::new(1_700_000_000_000, 1));
        assert_eq!(entries[1].timestamp, 1_700_000_000_000);
    }

    #[test]
    fn missing_data_is_malformed() {
        let raw = vec![("5-0".to_string(), vec!["other".into(), "x".into()])];
        assert!(matches!(decode_entries(raw), Err(QueueError::Malformed(_))));
    }

    #[test]
    fn full_pages_resume_after_the_last_id() {
        let entry = |ms| QueueEntry {
            token: SequenceToken::new(ms, 0),
            timestamp: ms as i64,
            payload: String::new(),
        };

        let full = vec![entry(10), entry(11), entry(12)];
        assert_eq!(resume_after(&full, 3), Some(SequenceToken::new(12, 0)));

        assert_eq!(resume_after(&[entry(13)], 3), None);
        assert_eq!(resume_after(&[], 3), None);
    }
}
