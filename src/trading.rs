//! Bot trading control
//!
//! `start_trading` / `stop_trading` commands and the trading status observed
//! from the backend.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::error::FeedError;
use crate::subscriptions::{StreamEvent, SubscriptionHandle, SubscriptionRouter};
use crate::transport::{START_TRADING_EVENT, STOP_TRADING_EVENT};
use crate::types::{normalize_symbol, Channel, TradingStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RsiConfig {
    pub enabled: bool,
    pub period: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BollingerConfig {
    pub enabled: bool,
    pub period: u32,
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MacdConfig {
    pub enabled: bool,
    pub fast_period: u32,
    pub slow_period: u32,
    pub signal_period: u32,
}

/// Indicator settings forwarded untouched to the backend strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorConfig {
    pub rsi: RsiConfig,
    pub bollinger: BollingerConfig,
    pub macd: MacdConfig,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi: RsiConfig {
                enabled: true,
                period: 14,
            },
            bollinger: BollingerConfig {
                enabled: true,
                period: 20,
                deviation: 2.0,
            },
            macd: MacdConfig {
                enabled: true,
                fast_period: 12,
                slow_period: 26,
                signal_period: 9,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartTradingParams {
    pub symbol: String,
    pub indicators: IndicatorConfig,
}

impl StartTradingParams {
    /// The backend expects the base asset only ("BTCUSDT" -> "BTC")
    pub fn new(symbol: &str, indicators: IndicatorConfig) -> Result<Self, FeedError> {
        let symbol = normalize_symbol(symbol)?;
        let base = match symbol.strip_suffix("USDT") {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => symbol,
        };
        Ok(Self {
            symbol: base,
            indicators,
        })
    }
}

/// Sends trading commands and tracks the status the backend reports
#[derive(Debug)]
pub struct TradingControl {
    manager: ConnectionManager,
    router: SubscriptionRouter,
    status: Arc<watch::Sender<TradingStatus>>,
    subscription: Option<SubscriptionHandle>,
}

impl TradingControl {
    pub fn new(manager: ConnectionManager, router: SubscriptionRouter) -> Self {
        let (status, _) = watch::channel(TradingStatus::Stopped);
        Self {
            manager,
            router,
            status: Arc::new(status),
            subscription: None,
        }
    }

    /// Start tracking `trading_status` events for `symbol`
    pub async fn track(&mut self, symbol: &str) -> Result<(), FeedError> {
        if let Some(handle) = self.subscription.take() {
            self.router.unsubscribe(handle);
        }
        let status = Arc::clone(&self.status);
        let handle = self
            .router
            .subscribe(symbol, Channel::TradingStatus, move |event| {
                if let StreamEvent::TradingStatus { status: next, .. } = event {
                    status.send_replace(next.clone());
                }
            })
            .await?;
        self.subscription = Some(handle);
        Ok(())
    }

    pub async fn start_trading(&self, params: &StartTradingParams) -> Result<(), FeedError> {
        let connection = self.manager.connect().await?;
        connection.send(START_TRADING_EVENT, serde_json::to_value(params)?)?;
        info!(symbol = %params.symbol, "Start trading requested");
        Ok(())
    }

    pub async fn stop_trading(&self) -> Result<(), FeedError> {
        let connection = self.manager.connect().await?;
        connection.send(STOP_TRADING_EVENT, json!({}))?;
        info!("Stop trading requested");
        Ok(())
    }

    pub fn status(&self) -> TradingStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<TradingStatus> {
        self.status.subscribe()
    }
}

impl Drop for TradingControl {
    fn drop(&mut self) {
        if let Some(handle) = self.subscription.take() {
            self.router.unsubscribe(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportConfig;
    use crate::transport::{MemoryConnector, SUBSCRIBE_EVENT, TRADING_STATUS_EVENT};

    #[test]
    fn start_params_strip_quote_suffix() {
        let params = StartTradingParams::new("btcusdt", IndicatorConfig::default()).unwrap();
        assert_eq!(params.symbol, "BTC");
        let params = StartTradingParams::new("USDT", IndicatorConfig::default()).unwrap();
        assert_eq!(params.symbol, "USDT");
    }

    #[test]
    fn indicator_wire_shape() {
        let value = serde_json::to_value(IndicatorConfig::default()).unwrap();
        assert_eq!(value["macd"]["fastPeriod"], 12);
        assert_eq!(value["bollinger"]["deviation"], 2.0);
        assert_eq!(value["rsi"]["period"], 14);
    }

    #[tokio::test]
    async fn commands_and_status_round_trip() {
        let (connector, mut peers) = MemoryConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector), TransportConfig::default());
        let router = SubscriptionRouter::new(manager.clone());
        let mut control = TradingControl::new(manager, router);
        let mut status = control.watch_status();

        control.track("BTCUSDT").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        peer.expect(SUBSCRIBE_EVENT).await.unwrap();

        let params = StartTradingParams::new("BTCUSDT", IndicatorConfig::default()).unwrap();
        control.start_trading(&params).await.unwrap();
        let start = peer.expect(START_TRADING_EVENT).await.unwrap();
        assert_eq!(start.data["symbol"], "BTC");

        peer.send(TRADING_STATUS_EVENT, json!({ "status": "TRADING_STARTED" }));
        status.changed().await.unwrap();
        assert_eq!(control.status(), TradingStatus::Started);

        control.stop_trading().await.unwrap();
        peer.expect(STOP_TRADING_EVENT).await.unwrap();
        peer.send(TRADING_STATUS_EVENT, json!({ "status": "TRADING_STOPPED" }));
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), TradingStatus::Stopped);
    }
}
