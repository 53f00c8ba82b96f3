//! Storage sinks
//!
//! This module provides:
//! - The `Sink` trait every storage backend implements
//! - `Storage`, which fans one batch out to all configured sinks
//! - A factory building sinks from their configuration tag
//!
//! Backend-specific shapes (file layout, line protocol, ...) live in
//! the submodules. The aggregator only ever talks to `Storage`.

pub mod influx;
pub mod jsonl;

use std::sync::Arc;

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::schema::Batch;

/// A long-term storage backend.
///
/// CONTRACT:
/// - `write` either durably persists the whole batch or fails
/// - A failed write leaves nothing half-applied that a retry with
///   the same batch would duplicate (beyond backend-side dedup)
/// - The batch is shared with other sinks and must not be mutated
///
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Sink name for logging.
    fn name(&self) -> &str;

    async fn write(&self, batch: &Batch) -> Result<(), SinkError>;
}

/// Which sinks already confirmed the current batch.
///
/// Lives for one flush (all retry attempts of one batch), so a retry
/// only calls the sinks that have not succeeded yet.
#[derive(Debug, Clone)]
pub struct Delivery {
    confirmed: Vec<bool>,
}

impl Delivery {
    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.confirmed.iter().all(|c| *c)
    }

    pub fn confirmed(&self) -> usize {
        self.confirmed.iter().filter(|c| **c).count()
    }
}

/// Every configured sink, written in configuration order.
#[derive(Clone)]
pub struct Storage {
    sinks: Vec<Arc<dyn Sink>>,
}

impl Storage {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    /// Builds every sink listed in configuration.
    pub async fn from_config(configs: &[SinkConfig]) -> Result<Self, SinkError> {
        let mut sinks = Vec::with_capacity(configs.len());
        for cfg in configs {
            sinks.push(build(cfg).await?);
        }
        Ok(Self::new(sinks))
    }

    pub fn names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn delivery(&self) -> Delivery {
        Delivery {
            confirmed: vec![false; self.sinks.len()],
        }
    }

    /// Writes `batch` to every sink not yet confirmed in `delivery`.
    ///
    /// All pending sinks are attempted even if one fails. The returned
    /// error is permanent if any sink failed permanently, otherwise the
    /// first transient failure.
    pub async fn write(&self, batch: &Batch, delivery: &mut Delivery) -> Result<(), SinkError> {
        let mut failure: Option<SinkError> = None;

        for (sink, confirmed) in self.sinks.iter().zip(delivery.confirmed.iter_mut()) {
            if *confirmed {
                continue;
            }

            match sink.write(batch).await {
                Ok(()) => *confirmed = true,
                Err(e) => {
                    log::warn!("{} write failed for {}: {}", sink.name(), batch.key, e);
                    failure = match failure {
                        Some(prev) if !prev.is_transient() => Some(prev),
                        Some(prev) if e.is_transient() => Some(prev),
                        _ => Some(e),
                    };
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Resolves one sink from its configuration tag.
pub async fn build(cfg: &SinkConfig) -> Result<Arc<dyn Sink>, SinkError> {
    match cfg {
        SinkConfig::Jsonl(c) => Ok(Arc::new(jsonl::JsonlSink::new(c.clone()))),
        SinkConfig::Influx(c) => Ok(Arc::new(influx::InfluxSink::connect(c.clone()).await?)),
    }
}
