use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::config::JsonlConfig;
use crate::error::SinkError;
use crate::schema::{Batch, Window};

use super::Sink;

/// Newline-delimited JSON files, one per batch.
///
/// Layout:
///     <root>/<source>/<kind>/<instrument>/<stem>.jsonl[.gz]
///
/// The stem is derived from the batch window (or flush time in cursor
/// mode), so a retried batch lands on the same path. Files are written
/// to a temp name and renamed into place only once fully flushed.
pub struct JsonlSink {
    cfg: JsonlConfig,
}

impl JsonlSink {
    pub fn new(cfg: JsonlConfig) -> Self {
        Self { cfg }
    }

    pub fn path_for(&self, batch: &Batch) -> PathBuf {
        let ext = if self.cfg.gzip { "jsonl.gz" } else { "jsonl" };
        self.cfg
            .path
            .join(component(&batch.key.source))
            .join(component(&batch.key.kind))
            .join(component(&batch.key.instrument))
            .join(format!("{}.{}", file_stem(batch), ext))
    }
}

/// Path-safe version of a key component ("BTC/USD" -> "BTC-USD").
fn component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect()
}

fn stamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y%m%dT%H%M%S%3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn file_stem(batch: &Batch) -> String {
    match batch.window {
        Window::Range { start, end } => format!("{}-{}", stamp(start), stamp(end)),
        Window::Cursor => stamp(batch.flushed_at),
    }
}

fn write_file(path: &Path, body: &[u8], gzip: bool) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension("tmp");
    {
        let file = BufWriter::new(File::create(&tmp)?);
        if gzip {
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(body)?;
            enc.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        } else {
            let mut file = file;
            file.write_all(body)?;
            file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
    }

    fs::rename(&tmp, path)
}

#[async_trait::async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut body = Vec::new();
        for record in &batch.records {
            serde_json::to_writer(&mut body, record)
                .map_err(|e| SinkError::Permanent(e.to_string()))?;
            body.push(b'\n');
        }

        let path = self.path_for(batch);
        let gzip = self.cfg.gzip;
        let target = path.clone();

        tokio::task::spawn_blocking(move || write_file(&target, &body, gzip))
            .await
            .map_err(|e| SinkError::Transient(format!("writer task failed: {e}")))??;

        log::debug!("jsonl: wrote {} records to {}", batch.len(), path.display());
        Ok(())
    }
}
