//! Transport layer
//!
//! A transport carries [`Envelope`]s, one JSON object per text frame:
//! `{"event": "<name>", "data": <payload>}`. Connectors hand the connection
//! manager a [`Link`]: a pair of channels plus a shutdown token. The raw socket
//! never leaves the connector's pump task.

mod memory;
mod ws;

pub use memory::{MemoryConnector, MemoryPeer};
pub use ws::WsConnector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;

// Client -> server events
pub const SELECT_COIN_EVENT: &str = "select_coin";
pub const GET_HISTORICAL_DATA_EVENT: &str = "get_historical_data";
pub const SUBSCRIBE_EVENT: &str = "subscribe";
pub const UNSUBSCRIBE_EVENT: &str = "unsubscribe";
pub const START_TRADING_EVENT: &str = "start_trading";
pub const STOP_TRADING_EVENT: &str = "stop_trading";

// Server -> client events
pub const HISTORICAL_DATA_EVENT: &str = "historical_data";
pub const ERROR_EVENT: &str = "error";
pub const KLINE_UPDATE_EVENT: &str = "kline_update";
pub const TRADE_UPDATE_EVENT: &str = "trade_update";
pub const TRADING_STATUS_EVENT: &str = "trading_status";
pub const TRADING_SIGNAL_EVENT: &str = "trading_signal";

/// One named event with its JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn decode(text: &str) -> Result<Self, FeedError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, FeedError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Established duplex link produced by a [`Connector`].
///
/// Dropping `outbound` or cancelling `shutdown` asks the pump to close the
/// transport; `inbound` yields `None` once the transport is gone.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    pub shutdown: CancellationToken,
}

/// Something that can perform a handshake and produce a [`Link`]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Get the connector name
    fn name(&self) -> &'static str;

    /// Perform one handshake. Deadlines are enforced by the caller.
    async fn open(&self) -> Result<Link, FeedError>;
}
