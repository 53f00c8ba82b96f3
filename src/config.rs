use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::schema::TrackedKey;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TICKSTORE_CONFIG";

/// Cursor-log retention must cover at least this many aggregation
/// intervals, otherwise entries could be trimmed before they are written.
pub const MIN_RETENTION_INTERVALS: u64 = 3;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// One immutable snapshot of `config.json`.
//
// Snapshots are compared structurally: the watcher only
// publishes a new one when it differs from the last, and the
// supervisor diffs two snapshots to decide which sources to
// start or stop.
//
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Sources (exchanges) and what to subscribe on each
    #[serde(default)]
    pub sources: BTreeMap<String, SubscriptionSpec>,

    /// Durable queue backend shared by workers and aggregator
    pub queue: QueueConfig,

    /// Long-term storage sinks, written in order
    #[serde(default)]
    pub storage: Vec<SinkConfig>,

    /// Aggregation interval: seconds, or a calendar unit
    #[serde(default = "default_interval")]
    pub storage_interval: Interval,

    /// Write attempts per batch and cycle
    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,

    /// Seconds to wait between write attempts
    #[serde(default = "default_storage_retry_wait")]
    pub storage_retry_wait: u64,

    /// Run one final aggregation pass before workers are stopped
    #[serde(default)]
    pub drain_on_stop: bool,

    /// Upper bound for the final drain pass
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Upper bound for joining one stopped worker
    #[serde(default = "default_worker_stop_timeout")]
    pub worker_stop_timeout_secs: u64,

    /// Seconds between config file polls
    #[serde(default = "default_reload_interval")]
    pub reload_interval: u64,
}

fn default_interval() -> Interval {
    Interval::Seconds(60)
}

fn default_storage_retries() -> u32 {
    5
}

fn default_storage_retry_wait() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_worker_stop_timeout() -> u64 {
    10
}

fn default_reload_interval() -> u64 {
    10
}

impl Config {
    /// Parses and validates a JSON document.
    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_json::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&data)
    }

    /// `$TICKSTORE_CONFIG`, falling back to `./config.json`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_interval.as_duration().is_zero() {
            return Err(ConfigError::Invalid(
                "storage_interval must be positive".into(),
            ));
        }

        if self.storage_retries == 0 {
            return Err(ConfigError::Invalid(
                "storage_retries must be at least 1".into(),
            ));
        }

        if !self.sources.is_empty() && self.storage.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one storage sink is required when sources are configured".into(),
            ));
        }

        for (source, spec) in &self.sources {
            for (kind, channel) in &spec.channels {
                if channel.symbols().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{source}.{kind} has no symbols"
                    )));
                }
            }
        }

        if let Some(retention) = self.queue.retention_secs {
            let floor = self
                .storage_interval
                .as_duration()
                .as_secs()
                .saturating_mul(MIN_RETENTION_INTERVALS);
            if retention < floor {
                return Err(ConfigError::Invalid(format!(
                    "queue.retention_secs ({retention}) must be at least {MIN_RETENTION_INTERVALS} \
                     aggregation intervals ({floor}s)"
                )));
            }
        }

        Ok(())
    }

    /// Every (source, kind, instrument) stream this snapshot describes.
    ///
    /// Order follows the sorted source / channel maps, so iteration over
    /// the result is deterministic across cycles.
    pub fn tracked_keys(&self) -> Vec<TrackedKey> {
        self.sources
            .iter()
            .flat_map(|(source, spec)| spec.tracked_keys(source))
            .collect()
    }

    /// Everything a worker needs apart from its own subscription.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            queue: self.queue.clone(),
        }
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.storage_retry_wait)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn worker_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_stop_timeout_secs)
    }

    pub fn reload_every(&self) -> Duration {
        Duration::from_secs(self.reload_interval.max(1))
    }
}

// ------------------------------------------------------------
// Subscription spec
// ------------------------------------------------------------
//
// Per-source block. Data channels are keyed by record kind
// ("trades", "l2_book", ...). Connection metadata lives in
// typed fields so it never turns into a tracked key.
//
// Example:
//   {
//     "trades":  ["BTC-USD", "ETH-USD"],
//     "l2_book": { "symbols": ["BTC-USD"], "book_depth": 10 },
//     "retries": 30
//   }
//
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct SubscriptionSpec {
    /// Connection retry budget for the worker (not a data channel)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Per-channel timeouts in seconds (not a data channel)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_timeouts: Option<BTreeMap<String, u64>>,

    /// Record kind -> instruments
    #[serde(flatten)]
    pub channels: BTreeMap<String, ChannelSpec>,
}

impl SubscriptionSpec {
    pub fn tracked_keys(&self, source: &str) -> Vec<TrackedKey> {
        self.channels
            .iter()
            .flat_map(|(kind, channel)| {
                channel
                    .symbols()
                    .iter()
                    .map(move |symbol| TrackedKey::new(source, kind.as_str(), symbol.as_str()))
            })
            .collect()
    }

    /// Longest silence tolerated on `kind`'s connection before it is
    /// dropped and reopened. Unset or 0 waits forever.
    pub fn channel_timeout(&self, kind: &str) -> Option<Duration> {
        self.channel_timeouts
            .as_ref()?
            .get(kind)
            .filter(|secs| **secs > 0)
            .map(|secs| Duration::from_secs(*secs))
    }
}

/// Either a bare symbol list or a block with book options.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ChannelSpec {
    Symbols(Vec<String>),
    Detailed(ChannelOptions),
}

impl ChannelSpec {
    pub fn symbols(&self) -> &[String] {
        match self {
            ChannelSpec::Symbols(s) => s,
            ChannelSpec::Detailed(o) => &o.symbols,
        }
    }

    pub fn book_depth(&self) -> Option<usize> {
        match self {
            ChannelSpec::Symbols(_) => None,
            ChannelSpec::Detailed(o) => o.book_depth,
        }
    }

    /// Whether book updates should be incremental rather than snapshots.
    /// Unset leaves the choice to the exchange adapter.
    pub fn book_delta(&self) -> Option<bool> {
        match self {
            ChannelSpec::Symbols(_) => None,
            ChannelSpec::Detailed(o) => o.book_delta,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChannelOptions {
    pub symbols: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_depth: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_delta: Option<bool>,
}

// ------------------------------------------------------------
// Queue configuration
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum QueueBackend {
    /// Redis Streams read from an in-process cursor
    Redis,

    /// Redis Streams read through a consumer group
    RedisGroup,

    /// In-process queue, lost on exit
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QueueConfig {
    pub backend: QueueBackend,

    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Keep committed entries this long for replay (cursor log only)
    #[serde(default)]
    pub retention_secs: Option<u64>,

    /// Remove entries once committed
    #[serde(default = "default_true")]
    pub del_after_read: bool,

    /// Flush the whole backend at startup
    #[serde(default)]
    pub start_flush: bool,

    /// Consumer group name (consumer-group log only)
    #[serde(default = "default_group")]
    pub group: String,

    /// Upper bound on entries fetched per read
    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_true() -> bool {
    true
}

fn default_group() -> String {
    "tickstore".into()
}

fn default_read_count() -> usize {
    100_000
}

impl QueueConfig {
    #[cfg(test)]
    pub fn memory() -> Self {
        Self {
            backend: QueueBackend::Memory,
            url: default_redis_url(),
            retention_secs: None,
            del_after_read: true,
            start_flush: false,
            group: default_group(),
            read_count: default_read_count(),
        }
    }
}

// ------------------------------------------------------------
// Sink configuration
// ------------------------------------------------------------
//
// The `type` tag selects the sink constructor (see `sink::build`).
//
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    Jsonl(JsonlConfig),
    Influx(InfluxConfig),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct JsonlConfig {
    /// Root directory for batch files
    pub path: PathBuf,

    /// Write `.jsonl.gz` instead of plain `.jsonl`
    #[serde(default)]
    pub gzip: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InfluxConfig {
    /// Base URL, e.g. "http://localhost:8086"
    pub host: String,

    /// Target database
    pub db: String,

    /// Issue CREATE DATABASE on startup
    #[serde(default)]
    pub create: bool,

    /// Request timeout in seconds
    #[serde(default = "default_influx_timeout")]
    pub timeout_secs: u64,
}

fn default_influx_timeout() -> u64 {
    30
}

// ------------------------------------------------------------
// Worker options
// ------------------------------------------------------------
//
// The slice of the snapshot sent along with every start
// command. Workers never see the live config object.
//
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkerOptions {
    pub queue: QueueConfig,
}

// ------------------------------------------------------------
// Aggregation interval
// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Minute,
    Hour,
    Day,
}

impl CalendarUnit {
    fn letter(self) -> char {
        match self {
            CalendarUnit::Minute => 'M',
            CalendarUnit::Hour => 'H',
            CalendarUnit::Day => 'D',
        }
    }

    pub fn seconds(self) -> u64 {
        match self {
            CalendarUnit::Minute => 60,
            CalendarUnit::Hour => 3_600,
            CalendarUnit::Day => 86_400,
        }
    }
}

/// `60` means poll every 60 seconds and read by cursor.
/// `"H"` / `"2H"` means calendar-aligned buckets of that size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "IntervalRepr", into = "IntervalRepr")]
pub enum Interval {
    Seconds(u64),
    Calendar { unit: CalendarUnit, multiplier: u32 },
}

impl Interval {
    pub fn as_duration(&self) -> Duration {
        match *self {
            Interval::Seconds(s) => Duration::from_secs(s),
            Interval::Calendar { unit, multiplier } => {
                Duration::from_secs(unit.seconds() * u64::from(multiplier))
            }
        }
    }

    pub fn is_calendar(&self) -> bool {
        matches!(self, Interval::Calendar { .. })
    }
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum IntervalRepr {
    Seconds(u64),
    Calendar(String),
}

impl TryFrom<IntervalRepr> for Interval {
    type Error = String;

    fn try_from(repr: IntervalRepr) -> Result<Self, Self::Error> {
        match repr {
            IntervalRepr::Seconds(s) => Ok(Interval::Seconds(s)),
            IntervalRepr::Calendar(s) => parse_calendar(&s),
        }
    }
}

impl From<Interval> for IntervalRepr {
    fn from(i: Interval) -> Self {
        match i {
            Interval::Seconds(s) => IntervalRepr::Seconds(s),
            Interval::Calendar { unit, multiplier: 1 } => {
                IntervalRepr::Calendar(unit.letter().to_string())
            }
            Interval::Calendar { unit, multiplier } => {
                IntervalRepr::Calendar(format!("{}{}", multiplier, unit.letter()))
            }
        }
    }
}

fn parse_calendar(raw: &str) -> Result<Interval, String> {
    let raw = raw.trim();
    let Some(letter) = raw.chars().last() else {
        return Err("empty interval".into());
    };

    let unit = match letter.to_ascii_uppercase() {
        'M' => CalendarUnit::Minute,
        'H' => CalendarUnit::Hour,
        'D' => CalendarUnit::Day,
        _ => return Err(format!("unknown interval unit in {raw:?}")),
    };

    let digits = &raw[..raw.len() - letter.len_utf8()];
    let multiplier = if digits.is_empty() {
        1
    } else {
        digits
            .parse::<u32>()
            .map_err(|_| format!("bad interval multiplier in {raw:?}"))?
    };

    if multiplier == 0 {
        return Err(format!("interval multiplier must be positive in {raw:?}"));
    }

    Ok(Interval::Calendar { unit, multiplier })
}
