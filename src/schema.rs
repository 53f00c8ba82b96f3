use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ------------------------------------------------------------
// Tracked key
// ------------------------------------------------------------
//
// One buffered stream and one sink-write unit.
//
// The string form doubles as the queue key, "<kind>-<source>-<instrument>",
// e.g. "trades-coinbase-BTC-USD".
//
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackedKey {
    pub source: String,
    pub kind: String,
    pub instrument: String,
}

impl TrackedKey {
    pub fn new(source: &str, kind: &str, instrument: &str) -> Self {
        Self {
            source: source.to_string(),
            kind: kind.to_string(),
            instrument: instrument.to_string(),
        }
    }
}

impl fmt::Display for TrackedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind, self.source, self.instrument)
    }
}

// ------------------------------------------------------------
// Sequence token
// ------------------------------------------------------------
//
// Totally ordered per key. Mirrors the Redis stream id layout
// "<ms>-<seq>" so every backend hands out the same shape.
//
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceToken {
    pub ms: u64,
    pub seq: u64,
}

impl SequenceToken {
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest token strictly greater than this one.
    pub fn next(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self { ms: self.ms + 1, seq: 0 },
        }
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for SequenceToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        let ms = ms.parse().map_err(|_| format!("bad sequence token {s:?}"))?;
        let seq = seq.parse().map_err(|_| format!("bad sequence token {s:?}"))?;
        Ok(Self { ms, seq })
    }
}

/// One buffered event.
///
/// `timestamp` is milliseconds since the Unix epoch and is what
/// windowed reads filter on.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub token: SequenceToken,
    pub timestamp: i64,
    pub payload: String,
}

// ------------------------------------------------------------
// Window
// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Everything since the last committed cursor.
    Cursor,

    /// Half-open `[start, end)` in milliseconds.
    Range { start: i64, end: i64 },
}

impl Window {
    pub fn contains(&self, ts: i64) -> bool {
        match *self {
            Window::Cursor => true,
            Window::Range { start, end } => ts >= start && ts < end,
        }
    }

    /// Whether a read for this window returns an uncommitted entry
    /// stamped `ts`.
    ///
    /// Reads are bounded above only. Uncommitted entries older than
    /// `start` (late arrivals, truncated or failed earlier reads, a
    /// backlog from before a restart) are flushed with this window.
    pub fn admits(&self, ts: i64) -> bool {
        match *self {
            Window::Cursor => true,
            Window::Range { end, .. } => ts < end,
        }
    }

    pub fn is_empty(&self) -> bool {
        match *self {
            Window::Cursor => false,
            Window::Range { start, end } => start >= end,
        }
    }

    pub fn end(&self) -> Option<i64> {
        match *self {
            Window::Cursor => None,
            Window::Range { end, .. } => Some(end),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Cursor => write!(f, "[cursor]"),
            Window::Range { start, end } => write!(f, "[{start}, {end})"),
        }
    }
}

/// Normalized records for one key and one window.
///
/// Sinks only ever see `&Batch`; none of them may assume they
/// are the only consumer.
#[derive(Debug, Clone)]
pub struct Batch {
    pub key: TrackedKey,
    pub window: Window,

    /// Wall-clock time of the flush, milliseconds
    pub flushed_at: i64,

    pub records: Vec<Value>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ------------------------------------------------------------
// Market messages
// ------------------------------------------------------------
//
// What ingestion workers publish into the queue. The `type`
// tag lets the aggregator tell books from trades without
// knowing which exchange produced them.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketMessage {
    Trade(TradeData),
    Book(BookData),
}

impl MarketMessage {
    /// Record kind used in the tracked key.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketMessage::Trade(_) => "trades",
            MarketMessage::Book(_) => "l2_book",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            MarketMessage::Trade(t) => &t.symbol,
            MarketMessage::Book(b) => &b.symbol,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            MarketMessage::Trade(t) => t.timestamp,
            MarketMessage::Book(b) => b.timestamp,
        }
    }
}

/// Single executed trade. Prices stay strings until normalization.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TradeData {
    pub exchange: String,
    pub symbol: String,

    /// Milliseconds since Unix epoch
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub price: String,
    pub amount: String,

    /// "buy" or "sell"
    pub side: String,
}

/// Level 2 book update.
///
/// Levels are `[price, size]`; asks ascending, bids descending.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BookData {
    pub exchange: String,
    pub symbol: String,
    pub timestamp: i64,

    /// true for incremental updates, false for snapshots
    #[serde(default)]
    pub delta: bool,

    pub asks: Vec<[String; 2]>,
    pub bids: Vec<[String; 2]>,
}
