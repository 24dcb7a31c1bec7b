//! Error taxonomy for the feed core and the paper execution loop

use thiserror::Error;

/// Transport, connection and request failures.
///
/// Clonable because one connection attempt may be awaited by many callers and
/// every one of them receives the same outcome.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("connection attempt did not complete within {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection closed by disconnect")]
    ConnectionClosed,
    #[error("request '{topic}' timed out after {timeout_ms}ms")]
    RequestTimeout { topic: String, timeout_ms: u64 },
    #[error("no data received for '{topic}'")]
    NoData { topic: String },
    #[error("request '{topic}' already in progress")]
    RequestInProgress { topic: String },
    #[error("server error: {0}")]
    ServerError(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<serde_json::Error> for FeedError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Refusals produced by the paper execution loop.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("insufficient balance: required {required:.2}, available {available:.2}")]
    InsufficientBalance { required: f64, available: f64 },
    #[error("{signal} rejected while {phase}")]
    InvalidSignalForState { signal: String, phase: String },
    #[error("no usable price for {symbol}")]
    PriceUnavailable { symbol: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_map_to_codec() {
        let err: FeedError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, FeedError::Codec(_)));
    }

    #[test]
    fn messages_name_the_topic() {
        let err = FeedError::RequestInProgress {
            topic: "historical_data".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "request 'historical_data' already in progress"
        );
    }
}
