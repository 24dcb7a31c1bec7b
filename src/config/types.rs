//! Configuration types and re-exports

pub use super::{
    AppConfig, LedgerCfg, LoggingCfg, MarketCfg, PaperCfg, SignalMode, TransportCfg,
};
