use chrono::DateTime;
use serde_json::{Value, json};

use crate::{
    config::ChannelSpec,
    schema::{BookData, MarketMessage, TradeData},
    util,
};

use super::adapter::{ChannelType, ExchangeAdapter};

/// Coinbase Exchange WebSocket adapter
///
/// wss://ws-feed.exchange.coinbase.com
///
/// Channels:
/// - matches      → trades
/// - level2_batch → book snapshot, then deltas
pub struct CoinbaseAdapter;

/// RFC 3339 "time" field to milliseconds, falling back to receipt time.
fn event_time(v: &Value) -> i64 {
    v.get("time")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp_millis())
        .unwrap_or_else(util::now_ms)
}

fn levels(raw: Option<&Value>, depth: Option<usize>) -> Option<Vec<[String; 2]>> {
    let levels = raw?.as_array()?;
    let take = depth.unwrap_or(levels.len());
    levels
        .iter()
        .take(take)
        .map(|l| Some([l.get(0)?.as_str()?.to_string(), l.get(1)?.as_str()?.to_string()]))
        .collect()
}

impl ExchangeAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn ws_url(&self) -> &'static str {
        "wss://ws-feed.exchange.coinbase.com"
    }

    fn build_subscribe_message(
        &self,
        channel: ChannelType,
        pairs: &[String],
        _options: &ChannelSpec,
    ) -> Value {
        let product_ids: Vec<String> = pairs
            .iter()
            .map(|p| util::symbol_to_exchange(self.name(), p))
            .collect();

        let name = match channel {
            ChannelType::Trades => "matches",
            ChannelType::OrderBooks => "level2_batch",
        };

        json!({
            "type": "subscribe",
            "product_ids": product_ids,
            "channels": [name]
        })
    }

    fn parse_message(&self, raw: &str) -> Option<MarketMessage> {
        let v: Value = serde_json::from_str(raw).ok()?;
        let exchange = self.name();

        match v.get("type")?.as_str()? {
            "match" | "last_match" => Some(MarketMessage::Trade(TradeData {
                exchange: exchange.to_string(),
                symbol: util::symbol_from_exchange(exchange, v.get("product_id")?.as_str()?),
                timestamp: event_time(&v),
                id: v.get("trade_id").map(|id| id.to_string()),
                price: v.get("price")?.as_str()?.to_string(),
                amount: v.get("size")?.as_str()?.to_string(),
                side: v.get("side")?.as_str()?.to_string(),
            })),

            "snapshot" => Some(MarketMessage::Book(BookData {
                exchange: exchange.to_string(),
                symbol: util::symbol_from_exchange(exchange, v.get("product_id")?.as_str()?),
                timestamp: event_time(&v),
                delta: false,
                asks: levels(v.get("asks"), None)?,
                bids: levels(v.get("bids"), None)?,
            })),

            // changes: [side, price, size]; size "0" removes the level
            "l2update" => {
                let mut bids = Vec::new();
                let mut asks = Vec::new();

                for c in v.get("changes")?.as_array()? {
                    let level = [c.get(1)?.as_str()?.to_string(), c.get(2)?.as_str()?.to_string()];
                    match c.get(0)?.as_str()? {
                        "buy" => bids.push(level),
                        "sell" => asks.push(level),
                        _ => {}
                    }
                }

                Some(MarketMessage::Book(BookData {
                    exchange: exchange.to_string(),
                    symbol: util::symbol_from_exchange(exchange, v.get("product_id")?.as_str()?),
                    timestamp: event_time(&v),
                    delta: true,
                    asks,
                    bids,
                }))
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_match() {
        let raw = r#"{"type":"match","trade_id":42,"product_id":"BTC-USD","price":"100.5",
                      "size":"0.1","side":"sell","time":"2024-03-10T00:00:01.500Z"}"#;
        let Some(MarketMessage::Trade(t)) = CoinbaseAdapter.parse_message(raw) else {
            panic!("expected trade");
        };
        assert_eq!(t.symbol, "BTC-USD");
        assert_eq!(t.timestamp, 1_710_028_801_500);
        assert_eq!(t.id.as_deref(), Some("42"));
        assert_eq!(t.amount, "0.1");
    }

    #[test]
    fn l2update_keeps_removals_as_deltas() {
        let raw = r#"{"type":"l2update","product_id":"ETH-USD","time":"2024-03-10T00:00:00Z",
                      "changes":[["buy","10.0","0"],["sell","11.0","2.5"]]}"#;
        let Some(MarketMessage::Book(b)) = CoinbaseAdapter.parse_message(raw) else {
            panic!("expected book");
        };
        assert!(b.delta);
        assert_eq!(b.bids, vec![["10.0".to_string(), "0".to_string()]]);
        assert_eq!(b.asks.len(), 1);
    }

    #[test]
    fn control_frames_are_ignored() {
        assert!(CoinbaseAdapter.parse_message(r#"{"type":"subscriptions","channels":[]}"#).is_none());
        assert!(CoinbaseAdapter.parse_message("not json").is_none());
    }
}
