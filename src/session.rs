//! Session: one explicitly owned feed connection and everything built on it
//!
//! A session is opened with a connector, hands out the correlator, router and
//! trading control that share its connection, and is closed explicitly.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::candles::{CandleSeries, ChartSink};
use crate::connection::{ConnectionManager, ConnectionState, TransportConfig};
use crate::correlator::{Correlator, HistoryRequest};
use crate::error::FeedError;
use crate::ledger::BoundedLedger;
use crate::paper::ChannelSignals;
use crate::subscriptions::{StreamEvent, SubscriptionGuard, SubscriptionRouter};
use crate::trading::TradingControl;
use crate::transport::Connector;
use crate::types::{normalize_symbol, Bar, Channel, Interval, TradePrint};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// Trade prints kept by [`TradeTape`]
    pub trade_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            trade_capacity: 20,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    manager: ConnectionManager,
    correlator: Correlator,
    router: SubscriptionRouter,
}

impl Session {
    /// Build the session and establish its connection
    pub async fn open(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, FeedError> {
        info!(connector = connector.name(), "Opening feed session");
        let manager = ConnectionManager::new(connector, config.transport.clone());
        let correlator = Correlator::new(manager.clone());
        let router = SubscriptionRouter::new(manager.clone());
        let session = Self {
            config,
            manager,
            correlator,
            router,
        };
        if let Err(e) = session.manager.connect().await {
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    /// Stop background work, drop all subscriptions and disconnect. Idempotent.
    pub fn close(&self) {
        self.router.shutdown();
        self.manager.disconnect();
        info!("Feed session closed");
    }

    pub fn is_open(&self) -> bool {
        self.manager.state() == ConnectionState::Connected
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn trading(&self) -> TradingControl {
        TradingControl::new(self.manager.clone(), self.router.clone())
    }

    /// Select `symbol`, stream its klines and seed the chart from history.
    ///
    /// The kline subscription is taken before the snapshot is requested, so
    /// ticks racing the snapshot are buffered by the series instead of lost.
    pub async fn load_chart<S>(
        &self,
        symbol: &str,
        interval: Interval,
        lookback: Duration,
        sink: S,
    ) -> Result<LiveChart<S>, FeedError>
    where
        S: ChartSink + 'static,
    {
        let symbol = self.router.select_symbol(symbol).await?;
        let series = Arc::new(Mutex::new(CandleSeries::new(sink)));
        let (prices, _) = watch::channel(None);
        let prices = Arc::new(prices);

        let handle = {
            let series = Arc::clone(&series);
            let prices = Arc::clone(&prices);
            self.router
                .subscribe(&symbol, Channel::Kline, move |event| {
                    let StreamEvent::Kline {
                        interval: tick_interval,
                        bar,
                        ..
                    } = event
                    else {
                        return;
                    };
                    if tick_interval.map_or(false, |i| i != interval) {
                        return;
                    }
                    let mut series = series.lock();
                    series.apply_tick(bar);
                    if series.is_seeded() {
                        prices.send_replace(series.last_close());
                    }
                })
                .await?
        };
        let guard = SubscriptionGuard::new(self.router.clone(), handle);

        let request = HistoryRequest::lookback(&symbol, interval, lookback);
        let history = match self.correlator.fetch_history(request).await {
            Ok(history) => history,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Chart load failed");
                return Err(e);
            }
        };

        {
            let mut series = series.lock();
            series.seed(&history);
            prices.send_replace(series.last_close());
        }
        info!(symbol = %symbol, interval = %interval, bars = history.len(), "Chart loaded");

        Ok(LiveChart {
            symbol,
            interval,
            series,
            prices,
            _guard: guard,
        })
    }

    /// Keep the most recent trade prints for `symbol`
    pub async fn trade_tape(&self, symbol: &str) -> Result<TradeTape, FeedError> {
        let symbol = normalize_symbol(symbol)?;
        let ledger = Arc::new(Mutex::new(BoundedLedger::new(self.config.trade_capacity)));
        let handle = {
            let ledger = Arc::clone(&ledger);
            self.router
                .subscribe(&symbol, Channel::Trade, move |event| {
                    if let StreamEvent::Trade { print, .. } = event {
                        ledger.lock().append(print.clone());
                    }
                })
                .await?
        };
        Ok(TradeTape {
            symbol,
            ledger,
            _guard: SubscriptionGuard::new(self.router.clone(), handle),
        })
    }

    /// Forward backend trading signals for `symbol` into a signal source
    pub async fn remote_signals(
        &self,
        symbol: &str,
    ) -> Result<(ChannelSignals, SubscriptionGuard), FeedError> {
        let (tx, source) = ChannelSignals::channel();
        let handle = self
            .router
            .subscribe(symbol, Channel::Signal, move |event| {
                if let StreamEvent::Signal(signal) = event {
                    let _ = tx.send(signal.clone());
                }
            })
            .await?;
        Ok((source, SubscriptionGuard::new(self.router.clone(), handle)))
    }
}

/// A chart kept live by a kline subscription. Dropping it unsubscribes.
pub struct LiveChart<S: ChartSink> {
    symbol: String,
    interval: Interval,
    series: Arc<Mutex<CandleSeries<S>>>,
    prices: Arc<watch::Sender<Option<f64>>>,
    _guard: SubscriptionGuard,
}

impl<S: ChartSink> LiveChart<S> {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.series.lock().bars().to_vec()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.series.lock().last_close()
    }

    /// Latest close, updated on every accepted tick
    pub fn prices(&self) -> watch::Receiver<Option<f64>> {
        self.prices.subscribe()
    }

    /// Run `f` against the sink under the series lock
    pub fn with_sink<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(self.series.lock().sink())
    }
}

/// Most recent trade prints for one symbol. Dropping it unsubscribes.
pub struct TradeTape {
    symbol: String,
    ledger: Arc<Mutex<BoundedLedger<TradePrint>>>,
    _guard: SubscriptionGuard,
}

impl TradeTape {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Newest first
    pub fn snapshot(&self) -> Arc<[TradePrint]> {
        self.ledger.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.lock().is_empty()
    }
}
