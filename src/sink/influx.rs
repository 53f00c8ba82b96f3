use std::collections::HashSet;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use crate::config::InfluxConfig;
use crate::error::SinkError;
use crate::schema::Batch;

use super::Sink;

/// Lines per HTTP request.
const CHUNK_LINES: usize = 100_000;

/// InfluxDB (1.x HTTP API) sink using line protocol.
///
/// Measurement is "<kind>-<source>", tagged with the instrument.
/// Influx silently overwrites points sharing series and timestamp,
/// so colliding timestamps inside a batch are bumped by 1ns.
pub struct InfluxSink {
    client: Client,
    write_url: Url,
}

impl InfluxSink {
    pub async fn connect(cfg: InfluxConfig) -> Result<Self, SinkError> {
        let host = cfg.host.trim_end_matches('/');
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| SinkError::Permanent(format!("influx client: {e}")))?;

        let write_url = Url::parse_with_params(&format!("{host}/write"), &[("db", cfg.db.as_str())])
            .map_err(|e| SinkError::Permanent(format!("influx url: {e}")))?;

        let sink = Self { client, write_url };

        if cfg.create {
            let query = format!("CREATE DATABASE \"{}\"", cfg.db);
            let url = Url::parse_with_params(&format!("{host}/query"), &[("q", query.as_str())])
                .map_err(|e| SinkError::Permanent(format!("influx url: {e}")))?;
            sink.post(url, String::new()).await?;
            log::info!("influx: ensured database {}", cfg.db);
        }

        Ok(sink)
    }

    async fn post(&self, url: Url, body: String) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("influx request: {e}")))?;

        classify(resp.status())
    }
}

/// 5xx and throttling are retryable, any other non-success is not.
fn classify(status: StatusCode) -> Result<(), SinkError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(SinkError::Transient(format!("influx returned {status}")))
    } else {
        Err(SinkError::Permanent(format!("influx returned {status}")))
    }
}

fn escape_tag(raw: &str) -> String {
    raw.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn field_value(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::String(s) => Some(format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))),
        _ => None,
    }
}

/// Line protocol for a whole batch.
pub fn to_lines(batch: &Batch) -> Result<Vec<String>, SinkError> {
    let measurement = escape_tag(&format!("{}-{}", batch.key.kind, batch.key.source));
    let pair = escape_tag(&batch.key.instrument);
    let mut used: HashSet<i64> = HashSet::with_capacity(batch.len());
    let mut lines = Vec::with_capacity(batch.len());

    for record in &batch.records {
        let obj = record
            .as_object()
            .ok_or_else(|| SinkError::Permanent(format!("record is not an object: {record}")))?;

        let ts_ms = obj
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| SinkError::Permanent("record has no numeric timestamp".into()))?;

        let mut ts = (ts_ms * 1_000_000.0) as i64;
        while !used.insert(ts) {
            ts += 1;
        }

        let fields: Vec<String> = obj
            .iter()
            .filter_map(|(k, v)| field_value(v).map(|v| format!("{}={}", escape_tag(k), v)))
            .collect();
        if fields.is_empty() {
            return Err(SinkError::Permanent("record has no fields".into()));
        }

        lines.push(format!("{},pair={} {} {}", measurement, pair, fields.join(","), ts));
    }

    Ok(lines)
}

#[async_trait::async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &str {
        "influx"
    }

    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        let lines = to_lines(batch)?;
        for chunk in lines.chunks(CHUNK_LINES) {
            self.post(self.write_url.clone(), chunk.join("\n")).await?;
        }
        log::debug!("influx: wrote {} points for {}", lines.len(), batch.key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::{TrackedKey, Window};

    fn batch(records: Vec<Value>) -> Batch {
        Batch {
            key: TrackedKey::new("coinbase", "trades", "BTC-USD"),
            window: Window::Cursor,
            flushed_at: 0,
            records,
        }
    }

    #[test]
    fn colliding_timestamps_are_bumped() {
        let lines = to_lines(&batch(vec![
            json!({"timestamp": 1000, "price": 1.5, "side": "buy"}),
            json!({"timestamp": 1000, "price": 1.6, "side": "sell"}),
        ]))
        .unwrap();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("trades-coinbase,pair=BTC-USD "));
        assert!(lines[0].ends_with(" 1000000000"));
        assert!(lines[1].ends_with(" 1000000001"));
        assert!(lines[1].contains("side=\"sell\""));
    }

    #[test]
    fn records_without_timestamp_are_permanent_errors() {
        let err = to_lines(&batch(vec![json!({"price": 1.0})])).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn status_classification() {
        assert!(classify(StatusCode::NO_CONTENT).is_ok());
        assert!(classify(StatusCode::SERVICE_UNAVAILABLE).unwrap_err().is_transient());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS).unwrap_err().is_transient());
        assert!(!classify(StatusCode::BAD_REQUEST).unwrap_err().is_transient());
    }
}
