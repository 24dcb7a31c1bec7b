//! Paper Execution Loop
//!
//! Simulates order execution against a virtual balance:
//! - **Two states**: idle (flat) and holding (position > 0)
//! - **BUY** converts a fixed notional into position at the current price
//! - **SELL** liquidates the entire position back into balance
//! - **Rejections are reported**, never swallowed: invalid-state signals,
//!   insufficient balance and missing prices all come back as errors and are
//!   published on the snapshot channel
//!
//! Signals come from an injectable [`SignalSource`] so the loop can be driven
//! deterministically in tests.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval as Ticker, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ExecutionError;
use crate::ledger::BoundedLedger;
use crate::types::{now_ms, Side, Signal};

// ─────────────────────────────────────────────────────────────────
// Configuration & state
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Starting virtual balance (quote currency)
    pub initial_balance: f64,
    /// Quote amount spent on every BUY
    pub notional: f64,
    /// Executions kept in the history ledger
    pub history_capacity: usize,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: 10_000.0,
            notional: 100.0,
            history_capacity: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperPhase {
    Idle,
    Holding,
}

impl fmt::Display for PaperPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaperPhase::Idle => write!(f, "idle"),
            PaperPhase::Holding => write!(f, "holding"),
        }
    }
}

/// One accepted paper execution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub total: f64,
    pub timestamp: i64,
    pub signal_source: String,
}

/// Immutable view of the executor for observers
#[derive(Debug, Clone, PartialEq)]
pub struct PaperSnapshot {
    pub balance: f64,
    pub position: f64,
    pub phase: PaperPhase,
    pub executions: Arc<[ExecutionRecord]>,
    pub accepted: u64,
    pub rejected: u64,
    pub last_rejection: Option<ExecutionError>,
}

// ─────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PaperExecutor {
    config: PaperConfig,
    balance: f64,
    position: f64,
    history: BoundedLedger<ExecutionRecord>,
    accepted: u64,
    rejected: u64,
    last_rejection: Option<ExecutionError>,
}

impl PaperExecutor {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            balance: config.initial_balance.max(0.0),
            position: 0.0,
            history: BoundedLedger::new(config.history_capacity),
            accepted: 0,
            rejected: 0,
            last_rejection: None,
            config,
        }
    }

    pub fn phase(&self) -> PaperPhase {
        if self.position > 0.0 {
            PaperPhase::Holding
        } else {
            PaperPhase::Idle
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn history(&self) -> Arc<[ExecutionRecord]> {
        self.history.snapshot()
    }

    /// Apply one signal. `market_price` is used when the signal carries none.
    pub fn execute(
        &mut self,
        signal: &Signal,
        market_price: Option<f64>,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let result = self.try_execute(signal, market_price);
        match &result {
            Ok(record) => {
                self.history.append(record.clone());
                self.accepted += 1;
            }
            Err(e) => {
                self.rejected += 1;
                self.last_rejection = Some(e.clone());
            }
        }
        result
    }

    fn try_execute(
        &mut self,
        signal: &Signal,
        market_price: Option<f64>,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let phase = self.phase();
        match (signal.side, phase) {
            (Side::Buy, PaperPhase::Idle) | (Side::Sell, PaperPhase::Holding) => {}
            _ => {
                return Err(ExecutionError::InvalidSignalForState {
                    signal: signal.side.to_string(),
                    phase: phase.to_string(),
                })
            }
        }

        let price = signal
            .price
            .filter(|p| usable_price(*p))
            .or(market_price.filter(|p| usable_price(*p)))
            .ok_or_else(|| ExecutionError::PriceUnavailable {
                symbol: signal.symbol.clone(),
            })?;

        let (quantity, total) = match signal.side {
            Side::Buy => {
                let total = self.config.notional;
                if total > self.balance {
                    return Err(ExecutionError::InsufficientBalance {
                        required: total,
                        available: self.balance,
                    });
                }
                let quantity = total / price;
                self.balance -= total;
                self.position += quantity;
                (quantity, total)
            }
            Side::Sell => {
                let quantity = self.position;
                let total = quantity * price;
                self.balance += total;
                self.position = 0.0;
                (quantity, total)
            }
        };

        Ok(ExecutionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            price,
            quantity,
            total,
            timestamp: now_ms(),
            signal_source: signal.source.clone(),
        })
    }

    pub fn snapshot(&self) -> PaperSnapshot {
        PaperSnapshot {
            balance: self.balance,
            position: self.position,
            phase: self.phase(),
            executions: self.history.snapshot(),
            accepted: self.accepted,
            rejected: self.rejected,
            last_rejection: self.last_rejection.clone(),
        }
    }
}

fn usable_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

// ─────────────────────────────────────────────────────────────────
// Signal sources
// ─────────────────────────────────────────────────────────────────

/// Something that yields trading signals until exhausted
#[async_trait]
pub trait SignalSource: Send {
    fn name(&self) -> &'static str;

    /// Wait for the next signal; `None` ends the loop
    async fn next_signal(&mut self) -> Option<Signal>;
}

/// Fixed sequence of signals
#[derive(Debug, Default)]
pub struct ScriptedSignals {
    queue: VecDeque<Signal>,
}

impl ScriptedSignals {
    pub fn new(signals: impl IntoIterator<Item = Signal>) -> Self {
        Self {
            queue: signals.into_iter().collect(),
        }
    }
}

#[async_trait]
impl SignalSource for ScriptedSignals {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn next_signal(&mut self) -> Option<Signal> {
        self.queue.pop_front()
    }
}

/// Signals pushed from elsewhere, e.g. the backend's signal channel
#[derive(Debug)]
pub struct ChannelSignals {
    rx: mpsc::UnboundedReceiver<Signal>,
}

impl ChannelSignals {
    pub fn channel() -> (mpsc::UnboundedSender<Signal>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl SignalSource for ChannelSignals {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn next_signal(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

/// Coin-flip BUY/SELL on a fixed period, for demos
#[derive(Debug)]
pub struct RandomSignals {
    symbol: String,
    ticker: Ticker,
    rng: StdRng,
}

impl RandomSignals {
    pub fn new(symbol: &str, period: Duration) -> Self {
        Self::with_rng(symbol, period, StdRng::from_entropy())
    }

    pub fn seeded(symbol: &str, period: Duration, seed: u64) -> Self {
        Self::with_rng(symbol, period, StdRng::seed_from_u64(seed))
    }

    fn with_rng(symbol: &str, period: Duration, rng: StdRng) -> Self {
        let period = period.max(Duration::from_millis(1));
        // First signal after one full period
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            symbol: symbol.to_string(),
            ticker,
            rng,
        }
    }
}

#[async_trait]
impl SignalSource for RandomSignals {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn next_signal(&mut self) -> Option<Signal> {
        self.ticker.tick().await;
        let side = if self.rng.gen::<f64>() > 0.5 {
            Side::Buy
        } else {
            Side::Sell
        };
        Some(Signal::new(self.symbol.clone(), side, "Auto"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────

/// Drives a [`PaperExecutor`] from a [`SignalSource`]
pub struct PaperLoop<S: SignalSource> {
    executor: PaperExecutor,
    source: S,
    prices: watch::Receiver<Option<f64>>,
    snapshots: watch::Sender<PaperSnapshot>,
}

impl<S: SignalSource> PaperLoop<S> {
    /// `prices` carries the latest market price (e.g. the last candle close)
    pub fn new(
        executor: PaperExecutor,
        source: S,
        prices: watch::Receiver<Option<f64>>,
    ) -> (Self, watch::Receiver<PaperSnapshot>) {
        let (snapshots, snapshot_rx) = watch::channel(executor.snapshot());
        (
            Self {
                executor,
                source,
                prices,
                snapshots,
            },
            snapshot_rx,
        )
    }

    /// Process signals until the source is exhausted or `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) -> PaperExecutor {
        info!(
            source = self.source.name(),
            balance = self.executor.balance(),
            "Paper execution loop started"
        );
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.source.next_signal() => next,
            };
            let Some(signal) = next else {
                info!(source = self.source.name(), "Signal source exhausted");
                break;
            };
            let _ = self.step(&signal);
        }
        info!(
            balance = self.executor.balance(),
            position = self.executor.position(),
            "Paper execution loop stopped"
        );
        self.executor
    }

    /// Apply one signal against the latest price and publish the result
    pub fn step(&mut self, signal: &Signal) -> Result<ExecutionRecord, ExecutionError> {
        let price = *self.prices.borrow();
        let result = self.executor.execute(signal, price);
        match &result {
            Ok(record) => info!(
                symbol = %record.symbol,
                side = %record.side,
                price = record.price,
                quantity = record.quantity,
                total = record.total,
                balance = self.executor.balance(),
                "Paper trade executed"
            ),
            Err(e) => warn!(
                symbol = %signal.symbol,
                side = %signal.side,
                error = %e,
                "Paper signal rejected"
            ),
        }
        self.snapshots.send_replace(self.executor.snapshot());
        result
    }

    pub fn executor(&self) -> &PaperExecutor {
        &self.executor
    }
}
