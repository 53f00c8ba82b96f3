use std::sync::atomic::Ordering;

use serde_json::{Map, Value, json};

use crate::metrics::METRICS;
use crate::schema::{BookData, MarketMessage, QueueEntry};

/// Fields converted from numeric strings to floats.
const NUMERIC_FIELDS: [&str; 3] = ["price", "size", "amount"];

/// Turns raw queue entries into flat sink rows.
///
/// - Trades: one row each, `type` tag dropped
/// - Books: one row per level, bids then asks, in feed order
/// - Anything else valid JSON: passed through as-is
///
/// Undecodable payloads are skipped with a warning; they can never
/// be written, so keeping them would wedge the key forever.
pub fn normalize(entries: &[QueueEntry]) -> Vec<Value> {
    let mut rows = Vec::with_capacity(entries.len());

    for entry in entries {
        let value: Value = match serde_json::from_str(&entry.payload) {
            Ok(v) => v,
            Err(e) => {
                METRICS.parse_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("skipping undecodable entry {}: {}", entry.token, e);
                continue;
            }
        };

        match serde_json::from_value::<MarketMessage>(value.clone()) {
            Ok(MarketMessage::Book(book)) => flatten_book(&book, &mut rows),
            Ok(MarketMessage::Trade(_)) => rows.push(strip_tag(value)),
            Err(_) => rows.push(value),
        }
    }

    rows
}

fn strip_tag(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => {
            obj.remove("type");
            Value::Object(numeric(obj))
        }
        other => other,
    }
}

fn numeric(mut obj: Map<String, Value>) -> Map<String, Value> {
    for field in NUMERIC_FIELDS {
        let parsed = obj
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok());
        if let Some(n) = parsed {
            obj.insert(field.to_string(), json!(n));
        }
    }
    obj
}

fn flatten_book(book: &BookData, rows: &mut Vec<Value>) {
    for (side, levels) in [("bid", &book.bids), ("ask", &book.asks)] {
        for [price, size] in levels {
            let row = json!({
                "exchange": book.exchange,
                "symbol": book.symbol,
                "side": side,
                "price": price,
                "size": size,
                "timestamp": book.timestamp,
                "delta": book.delta,
            });
            if let Value::Object(obj) = row {
                rows.push(Value::Object(numeric(obj)));
            }
        }
    }
}
