//! Configuration management for chartfeed
//!
//! Loads from optional config files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::connection::TransportConfig;
use crate::paper::PaperConfig;
use crate::session::SessionConfig;
use crate::types::{normalize_symbol, Interval};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub transport: TransportCfg,
    pub market: MarketCfg,
    pub ledger: LedgerCfg,
    pub paper: PaperCfg,
    pub logging: LoggingCfg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportCfg {
    /// Backend websocket endpoint
    pub url: String,
    /// Handshake deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Default deadline for correlated requests in milliseconds
    pub request_timeout_ms: u64,
    /// Inbound event buffer per connection
    pub event_buffer: usize,
    /// Keepalive ping interval in seconds
    pub ping_interval_secs: u64,
    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketCfg {
    /// Trading pair shown on startup
    pub symbol: String,
    /// Kline interval (1m, 5m, 15m, 1h, 4h, 1d, 1w)
    pub interval: String,
    /// History window requested on load, in hours
    pub lookback_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerCfg {
    /// Trade prints kept for rendering
    pub trade_capacity: usize,
    /// Paper executions kept for rendering
    pub execution_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperCfg {
    /// Enable the paper execution loop
    pub enabled: bool,
    /// Starting virtual balance (quote currency)
    pub initial_balance: f64,
    /// Quote amount converted on every BUY
    pub notional: f64,
    /// Signal generator period in seconds (random mode)
    pub signal_interval_secs: u64,
    /// "random" (local generator) or "remote" (backend signal channel)
    pub signal_mode: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingCfg {
    /// EnvFilter directive used when RUST_LOG is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Transport defaults
            .set_default("transport.url", "ws://localhost:5000/ws")?
            .set_default("transport.connect_timeout_ms", 20_000)?
            .set_default("transport.request_timeout_ms", 30_000)?
            .set_default("transport.event_buffer", 1024)?
            .set_default("transport.ping_interval_secs", 10)?
            .set_default("transport.reconnect_base_delay_ms", 1_000)?
            .set_default("transport.reconnect_max_delay_ms", 60_000)?
            // Market defaults
            .set_default("market.symbol", "BTCUSDT")?
            .set_default("market.interval", "1h")?
            .set_default("market.lookback_hours", 168)?
            // Ledger defaults
            .set_default("ledger.trade_capacity", 20)?
            .set_default("ledger.execution_capacity", 5)?
            // Paper trading defaults
            .set_default("paper.enabled", true)?
            .set_default("paper.initial_balance", 10_000.0)?
            .set_default("paper.notional", 100.0)?
            .set_default("paper.signal_interval_secs", 60)?
            .set_default("paper.signal_mode", "random")?
            // Logging defaults
            .set_default("logging.filter", "info")?
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CHARTFEED_*)
            .add_source(Environment::with_prefix("CHARTFEED").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://"))
        {
            bail!("transport.url must be a ws:// or wss:// URL");
        }
        if self.transport.connect_timeout_ms == 0 || self.transport.request_timeout_ms == 0 {
            bail!("transport timeouts must be positive");
        }
        if self.transport.event_buffer == 0 {
            bail!("transport.event_buffer must be positive");
        }
        if self.transport.reconnect_base_delay_ms > self.transport.reconnect_max_delay_ms {
            bail!("transport.reconnect_base_delay_ms exceeds reconnect_max_delay_ms");
        }
        normalize_symbol(&self.market.symbol).context("market.symbol")?;
        self.interval()?;
        if self.ledger.trade_capacity == 0 || self.ledger.execution_capacity == 0 {
            bail!("ledger capacities must be positive");
        }
        if !self.paper.initial_balance.is_finite() || self.paper.initial_balance < 0.0 {
            bail!("paper.initial_balance must be a finite non-negative number");
        }
        if !self.paper.notional.is_finite() || self.paper.notional <= 0.0 {
            bail!("paper.notional must be a finite positive number");
        }
        self.signal_mode()?;
        Ok(())
    }

    pub fn interval(&self) -> Result<Interval> {
        Interval::from_str(&self.market.interval)
            .with_context(|| format!("Unknown market.interval: {}", self.market.interval))
    }

    pub fn signal_mode(&self) -> Result<SignalMode> {
        match self.paper.signal_mode.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(SignalMode::Random),
            "remote" => Ok(SignalMode::Remote),
            other => bail!("Unknown paper.signal_mode: {}", other),
        }
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.market.lookback_hours.saturating_mul(3_600))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.transport.request_timeout_ms),
            event_buffer: self.transport.event_buffer,
            reconnect_base_delay: Duration::from_millis(self.transport.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.transport.reconnect_max_delay_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            transport: self.transport_config(),
            trade_capacity: self.ledger.trade_capacity,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.transport.ping_interval_secs)
    }

    pub fn signal_interval(&self) -> Duration {
        Duration::from_secs(self.paper.signal_interval_secs.max(1))
    }

    pub fn paper_config(&self) -> PaperConfig {
        PaperConfig {
            initial_balance: self.paper.initial_balance,
            notional: self.paper.notional,
            history_capacity: self.ledger.execution_capacity,
        }
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "url={} symbol={} interval={} paper={} signals={}",
            self.transport.url,
            self.market.symbol,
            self.market.interval,
            self.paper.enabled,
            self.paper.signal_mode
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

/// Where the paper loop gets its signals from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMode {
    Random,
    Remote,
}
