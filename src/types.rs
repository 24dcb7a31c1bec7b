//! Core types used throughout chartfeed
//!
//! Defines bars, trade prints, intervals, channels, signals and the wire
//! shapes they travel in.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FeedError;

/// Normalize a trading pair to upper-case alphanumeric ASCII (e.g. "btcusdt" -> "BTCUSDT")
pub fn normalize_symbol(symbol: &str) -> Result<String, FeedError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(FeedError::InvalidArgument(format!(
            "symbol must be non-empty alphanumeric ASCII, got '{symbol}'"
        )));
    }
    Ok(symbol)
}

/// Supported kline intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
}

impl Default for Interval {
    fn default() -> Self {
        Interval::Hour1
    }
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
            Interval::Week1 => "1w",
        }
    }

    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::Min1 => 60_000,
            Interval::Min5 => 300_000,
            Interval::Min15 => 900_000,
            Interval::Hour1 => 3_600_000,
            Interval::Hour4 => 14_400_000,
            Interval::Day1 => 86_400_000,
            Interval::Week1 => 604_800_000,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Some(Interval::Min1),
            "5m" => Some(Interval::Min5),
            "15m" => Some(Interval::Min15),
            "1h" => Some(Interval::Hour1),
            "4h" => Some(Interval::Hour4),
            "1d" => Some(Interval::Day1),
            "1w" => Some(Interval::Week1),
            _ => None,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV bar.
///
/// `interval_start` is kept exactly as received. Producers disagree on the
/// unit (seconds or milliseconds); [`crate::candles::CandleSeries`] is the only
/// place that normalizes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "time")]
    pub interval_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

/// Live trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePrint {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub price: f64,
    pub quantity: f64,
    #[serde(rename = "time")]
    pub timestamp: i64,
    #[serde(rename = "isBuyerMaker", default)]
    pub maker_flag: bool,
}

/// Trade ids arrive either as strings or as numbers
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unsupported trade id: {other}"
        ))),
    }
}

/// Streaming channels a subscription can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Kline interval updates
    Kline,
    /// Trade prints
    Trade,
    /// Bot status transitions
    TradingStatus,
    /// Trading signals produced by the backend strategy
    Signal,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Kline => "kline",
            Channel::Trade => "trade",
            Channel::TradingStatus => "trading_status",
            Channel::Signal => "signal",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading side of a signal or execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Trading signal consumed by the paper execution loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    #[serde(rename = "action")]
    pub side: Side,
    /// Price attached by the producer, if any. Falls back to the price feed.
    #[serde(default)]
    pub price: Option<f64>,
    /// Who produced the signal ("Auto", "remote", strategy name...)
    #[serde(default = "default_signal_source")]
    pub source: String,
}

fn default_signal_source() -> String {
    "remote".to_string()
}

impl Signal {
    pub fn new(symbol: impl Into<String>, side: Side, source: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            price: None,
            source: source.into(),
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }
}

/// Bot trading status as observed from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradingStatus {
    Started,
    Stopped,
    Error(String),
}

impl TradingStatus {
    /// Map a wire status string (`TRADING_STARTED`, `TRADING_STOPPED`, `ERROR`)
    pub fn from_wire(status: &str, message: Option<&str>) -> Option<Self> {
        match status.trim().to_uppercase().as_str() {
            "TRADING_STARTED" | "STARTED" => Some(TradingStatus::Started),
            "TRADING_STOPPED" | "STOPPED" => Some(TradingStatus::Stopped),
            "ERROR" | "TRADING_ERROR" => Some(TradingStatus::Error(
                message.unwrap_or("unknown error").to_string(),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for TradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingStatus::Started => write!(f, "started"),
            TradingStatus::Stopped => write!(f, "stopped"),
            TradingStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalization_rejects_garbage() {
        assert_eq!(normalize_symbol(" btcusdt ").unwrap(), "BTCUSDT");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("BTC/USDT").is_err());
    }

    #[test]
    fn interval_parses_and_displays() {
        assert_eq!(Interval::from_str("1H"), Some(Interval::Hour1));
        assert_eq!(Interval::Hour4.to_string(), "4h");
        assert_eq!(Interval::Min15.duration_ms(), 900_000);
        assert_eq!(Interval::from_str("2h"), None);
    }

    #[test]
    fn trade_print_accepts_numeric_ids() {
        let print: TradePrint = serde_json::from_value(serde_json::json!({
            "id": 42,
            "price": 100.5,
            "quantity": 0.25,
            "time": 1_700_000_000_000i64,
            "isBuyerMaker": true
        }))
        .unwrap();
        assert_eq!(print.id, "42");
        assert!(print.maker_flag);
    }

    #[test]
    fn bar_validation_catches_bad_values() {
        let bar = Bar {
            interval_start: 1,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        assert!(bar.is_valid());
        assert!(!Bar { close: f64::NAN, ..bar }.is_valid());
        assert!(!Bar { volume: -1.0, ..bar }.is_valid());
    }

    #[test]
    fn trading_status_maps_wire_values() {
        assert_eq!(
            TradingStatus::from_wire("TRADING_STOPPED", None),
            Some(TradingStatus::Stopped)
        );
        assert_eq!(
            TradingStatus::from_wire("ERROR", Some("boom")),
            Some(TradingStatus::Error("boom".to_string()))
        );
        assert_eq!(TradingStatus::from_wire("???", None), None);
    }
}
