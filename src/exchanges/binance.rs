use serde_json::{Value, json};

use crate::{
    config::ChannelSpec,
    schema::{BookData, MarketMessage, TradeData},
    util,
};

use super::adapter::{ChannelType, ExchangeAdapter};

/// Depths Binance accepts for partial book streams.
const PARTIAL_DEPTHS: [usize; 3] = [5, 10, 20];

/// Binance (Global) Spot WebSocket adapter
///
/// https://developers.binance.com/docs/binance-spot-api-docs/websocket-market-streams
///
/// Streams:
/// - <symbol>@trade            → trades
/// - <symbol>@depth@100ms      → book deltas
/// - <symbol>@depth<N>@100ms   → partial snapshots when `book_depth`
///                               is 5, 10 or 20, unless `book_delta`
///                               is set
pub struct BinanceAdapter;

fn levels(raw: &Value) -> Vec<[String; 2]> {
    raw.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|x| Some([x.get(0)?.as_str()?.to_string(), x.get(1)?.as_str()?.to_string()]))
                .collect()
        })
        .unwrap_or_default()
}

impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn ws_url(&self) -> &'static str {
        "wss://stream.binance.com:9443/stream"
    }

    fn build_subscribe_message(
        &self,
        channel: ChannelType,
        pairs: &[String],
        options: &ChannelSpec,
    ) -> Value {
        // explicit deltas win over a partial depth
        let depth = match options.book_delta() {
            Some(true) => None,
            _ => options.book_depth().filter(|d| PARTIAL_DEPTHS.contains(d)),
        };

        let streams: Vec<String> = pairs
            .iter()
            .map(|p| {
                let symbol = util::symbol_to_exchange(self.name(), p).to_lowercase();
                match (channel, depth) {
                    (ChannelType::Trades, _) => format!("{symbol}@trade"),
                    (ChannelType::OrderBooks, Some(d)) => format!("{symbol}@depth{d}@100ms"),
                    (ChannelType::OrderBooks, None) => format!("{symbol}@depth@100ms"),
                }
            })
            .collect();

        json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "id": util::now_ms()
        })
    }

    fn parse_message(&self, raw: &str) -> Option<MarketMessage> {
        let v: Value = serde_json::from_str(raw).ok()?;
        let exchange = self.name();

        // { "result": null, "id": 123 }
        if v.get("result").is_some() {
            return None;
        }

        // combined stream wrapper: { "stream": "...", "data": {...} }
        let stream = v.get("stream").and_then(Value::as_str).unwrap_or_default();
        let data = v.get("data").unwrap_or(&v);

        // partial depth frames carry no event type, only the stream name
        if data.get("e").is_none() && data.get("lastUpdateId").is_some() {
            let symbol = stream.split('@').next()?;
            return Some(MarketMessage::Book(BookData {
                exchange: exchange.to_string(),
                symbol: util::symbol_from_exchange(exchange, symbol),
                timestamp: util::now_ms(),
                delta: false,
                asks: levels(&data["asks"]),
                bids: levels(&data["bids"]),
            }));
        }

        match data.get("e")?.as_str()? {
            "trade" => Some(MarketMessage::Trade(TradeData {
                exchange: exchange.to_string(),
                symbol: util::symbol_from_exchange(exchange, data.get("s")?.as_str()?),
                timestamp: data["T"].as_i64().unwrap_or_else(util::now_ms),
                id: data.get("t").map(|id| id.to_string()),
                price: data.get("p")?.as_str()?.to_string(),
                amount: data.get("q")?.as_str()?.to_string(),
                // buyer is maker → aggressor sold
                side: if data["m"].as_bool().unwrap_or(false) {
                    "sell".into()
                } else {
                    "buy".into()
                },
            })),

            "depthUpdate" => Some(MarketMessage::Book(BookData {
                exchange: exchange.to_string(),
                symbol: util::symbol_from_exchange(exchange, data.get("s")?.as_str()?),
                timestamp: data["E"].as_i64().unwrap_or_else(util::now_ms),
                delta: true,
                asks: levels(&data["a"]),
                bids: levels(&data["b"]),
            })),

            _ => None,
        }
    }
}
