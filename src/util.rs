/// Utility helpers shared by workers, queue backends and sinks.
///
/// IMPORTANT:
/// - No exchange-specific business logic beyond symbol mapping.
/// - Everything here must stay deterministic and cheap.
///
use chrono::Utc;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert an internal symbol into the exchange-specific format.
///
/// Internal format is BASE-QUOTE, as written in the config file.
///
/// Examples:
/// - ("binance", "BTC-USDT")  -> "BTCUSDT"
/// - ("coinbase", "BTC-USD")  -> "BTC-USD"
///
pub fn symbol_to_exchange(exchange: &str, symbol: &str) -> String {
    match exchange {
        "binance" => symbol.replace('-', ""),
        _ => symbol.to_string(),
    }
}

/// Quote assets tried, longest first, when an exchange glues
/// BASE and QUOTE together without a separator.
const GLUED_QUOTES: [&str; 5] = ["USDT", "USDC", "BUSD", "USD", "BTC"];

/// Convert an exchange-specific symbol into the internal format.
///
/// Examples:
/// - ("binance", "BTCUSDT")   -> "BTC-USDT"
/// - ("coinbase", "BTC-USD")  -> "BTC-USD"
///
pub fn symbol_from_exchange(exchange: &str, symbol: &str) -> String {
    match exchange {
        "binance" => {
            let upper = symbol.to_uppercase();
            for quote in GLUED_QUOTES {
                if let Some(base) = upper.strip_suffix(quote) {
                    if !base.is_empty() {
                        return format!("{base}-{quote}");
                    }
                }
            }
            upper
        }
        _ => symbol.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_round_trip() {
        assert_eq!(symbol_to_exchange("binance", "ETH-USDT"), "ETHUSDT");
        assert_eq!(symbol_from_exchange("binance", "ethusdt"), "ETH-USDT");
        assert_eq!(symbol_from_exchange("binance", "SOLBTC"), "SOL-BTC");
    }

    #[test]
    fn separator_exchanges_pass_through() {
        assert_eq!(symbol_to_exchange("coinbase", "BTC-USD"), "BTC-USD");
        assert_eq!(symbol_from_exchange("coinbase", "BTC-USD"), "BTC-USD");
    }
}
