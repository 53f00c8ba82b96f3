use serde_json::Value;

use crate::config::ChannelSpec;
use crate::schema::MarketMessage;

/// Logical data channels a worker can subscribe to.
///
/// Each maps to one record kind in the queue ("trades", "l2_book").
/// Every exchange adapter translates them to its own WebSocket
/// channels.
///
/// IMPORTANT:
/// - Adding a variant requires changes in every adapter
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Trade stream (individual executions)
    Trades,

    /// Level 2 book updates
    OrderBooks,
}

impl ChannelType {
    /// Resolves a subscription key from configuration.
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "trades" => Some(ChannelType::Trades),
            "l2_book" => Some(ChannelType::OrderBooks),
            _ => None,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ChannelType::Trades => "trades",
            ChannelType::OrderBooks => "l2_book",
        }
    }
}

/// Boundary between the generic collector runtime and one
/// exchange's WebSocket API.
///
/// Each implementation must:
/// - Build the subscribe payload for a channel
/// - Parse raw frames into `MarketMessage`
///
/// THREAD SAFETY:
/// - Adapter instances are shared across connection tasks
///
pub trait ExchangeAdapter: Send + Sync {
    /// Canonical exchange name, equal to the source key in config.
    fn name(&self) -> &'static str;

    /// Full WebSocket endpoint (wss://...).
    fn ws_url(&self) -> &'static str;

    /// Builds the subscribe message for `channel`.
    ///
    /// PARAMETERS:
    /// - `pairs`: internal symbols (BASE-QUOTE)
    /// - `options`: the channel's configuration block
    ///
    /// MUST NOT perform network I/O.
    ///
    fn build_subscribe_message(
        &self,
        channel: ChannelType,
        pairs: &[String],
        options: &ChannelSpec,
    ) -> Value;

    /// Parses one text frame.
    ///
    /// OUTPUT:
    /// - Some(MarketMessage) for market data
    /// - None for heartbeats, acks, errors and anything unsupported
    ///
    /// DATA NORMALIZATION:
    /// - Symbols in internal format (BASE-QUOTE)
    /// - Timestamps in milliseconds since Unix epoch
    /// - Numeric values stay strings
    ///
    /// Must never panic on malformed input.
    ///
    fn parse_message(&self, raw: &str) -> Option<MarketMessage>;
}
