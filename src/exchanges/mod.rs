//! Exchange adapter registry and factory
//!
//! This module provides:
//! - Central registration of all supported exchanges
//! - A factory function to resolve adapters by source name
//!
//! All exchange-specific logic lives in the adapter modules. Workers
//! interact exclusively through the `ExchangeAdapter` trait.

pub mod adapter;
mod binance;
mod coinbase;

use std::sync::Arc;

use adapter::ExchangeAdapter;

/// Returns the adapter for a configured source.
///
/// CONTRACT:
/// - `name` is the source key in config.json
/// - Adapter names are lowercase and stable
///
/// RETURNS `None` if the exchange is unknown.
///
pub fn get_adapter(name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
    match name {
        "binance" => Some(Arc::new(binance::BinanceAdapter)),
        "coinbase" => Some(Arc::new(coinbase::CoinbaseAdapter)),
        _ => None,
    }
}
