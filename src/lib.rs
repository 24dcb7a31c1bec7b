//! Chartfeed Library
//!
//! Streaming market-data core: one shared connection carrying correlated
//! history requests and live subscriptions, a candle merge engine, bounded
//! ledgers and a paper execution loop.

pub mod candles;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod ledger;
pub mod paper;
pub mod session;
pub mod simulator;
pub mod subscriptions;
pub mod telemetry;
pub mod trading;
pub mod transport;
pub mod types;

pub use candles::{CandleSeries, ChartSink, MergeOutcome, RecordingSink};
pub use connection::{Connection, ConnectionEvent, ConnectionManager, ConnectionState, TransportConfig};
pub use correlator::{Correlator, HistoryRequest, Topic};
pub use error::{ExecutionError, FeedError};
pub use ledger::BoundedLedger;
pub use paper::{PaperConfig, PaperExecutor, PaperLoop, PaperSnapshot, SignalSource};
pub use session::{LiveChart, Session, SessionConfig, TradeTape};
pub use subscriptions::{StreamEvent, SubscriptionHandle, SubscriptionRouter};
pub use types::{Bar, Channel, Interval, Side, Signal, TradePrint, TradingStatus};
