//! Deterministic in-process backend
//!
//! Serves [`MemoryPeer`]s the way the real feed server would: answers history
//! requests with a synthetic random walk, streams klines and trades for
//! subscribed symbols and acknowledges trading commands. Used by the binary's
//! `--simulate` mode and by the integration tests.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::{
    MemoryPeer, ERROR_EVENT, GET_HISTORICAL_DATA_EVENT, HISTORICAL_DATA_EVENT, KLINE_UPDATE_EVENT,
    SELECT_COIN_EVENT, START_TRADING_EVENT, STOP_TRADING_EVENT, SUBSCRIBE_EVENT,
    TRADE_UPDATE_EVENT, TRADING_SIGNAL_EVENT, TRADING_STATUS_EVENT, UNSUBSCRIBE_EVENT,
};
use crate::types::{now_ms, Bar, Channel, Interval, Side};

const MAX_HISTORY_BARS: i64 = 1_000;
const START_PRICE: f64 = 100_000.0;
/// Ticks between two trading signals while trading is started
const SIGNAL_EVERY_TICKS: u64 = 20;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Period of kline / trade emission
    pub tick_every: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_every: Duration::from_millis(500),
        }
    }
}

/// Serve every peer arriving on `peers` until `shutdown` fires
pub fn spawn_simulator(
    mut peers: mpsc::UnboundedReceiver<MemoryPeer>,
    config: SimulatorConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Simulated feed backend started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                peer = peers.recv() => match peer {
                    Some(peer) => {
                        tokio::spawn(serve_peer(peer, config.clone(), shutdown.child_token()));
                    }
                    None => break,
                },
            }
        }
        info!("Simulated feed backend stopped");
    })
}

/// Align `timestamp_ms` down to the start of its interval
pub fn interval_open_time(timestamp_ms: i64, interval_ms: i64) -> i64 {
    if interval_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(interval_ms)
}

/// Synthetic bars covering `[start, end]`, at most the newest `MAX_HISTORY_BARS`
pub fn build_history(start_ms: i64, end_ms: i64, interval: Interval) -> Vec<Bar> {
    let step = interval.duration_ms();
    let last = interval_open_time(end_ms, step);
    let first = interval_open_time(start_ms, step).max(last - (MAX_HISTORY_BARS - 1) * step);
    if first > last {
        return Vec::new();
    }

    let mut bars = Vec::new();
    let mut price = START_PRICE;
    let mut open_time = first;
    let mut n = 0u64;
    while open_time <= last {
        let drift = ((n % 7) as f64 - 3.0) * 2.1;
        let open = price;
        let close = (open + drift).max(1.0);
        bars.push(Bar {
            interval_start: open_time,
            open,
            high: open.max(close) + 1.25,
            low: (open.min(close) - 1.1).max(0.5),
            close,
            volume: 2.0 + (n % 5) as f64 * 0.3,
        });
        price = close;
        open_time += step;
        n += 1;
    }
    bars
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default)]
    symbol: String,
    interval: Interval,
    start_time: i64,
    end_time: i64,
}

#[derive(Deserialize)]
struct SubscriptionIntent {
    symbol: String,
    channel: Channel,
}

struct PeerState {
    subscriptions: HashSet<(String, Channel)>,
    interval: Interval,
    price: f64,
    forming: Option<Bar>,
    trade_id: u64,
    ticks: u64,
    trading: Option<String>,
    next_side: Side,
}

impl PeerState {
    fn new() -> Self {
        Self {
            subscriptions: HashSet::new(),
            interval: Interval::Min1,
            price: START_PRICE,
            forming: None,
            trade_id: 0,
            ticks: 0,
            trading: None,
            next_side: Side::Buy,
        }
    }

    fn handle(&mut self, peer: &MemoryPeer, event: &str, data: Value) {
        match event {
            GET_HISTORICAL_DATA_EVENT => match serde_json::from_value::<HistoryQuery>(data) {
                Ok(query) => {
                    self.interval = query.interval;
                    let bars = build_history(query.start_time, query.end_time, query.interval);
                    if let Some(last) = bars.last() {
                        self.price = last.close;
                    }
                    debug!(symbol = %query.symbol, count = bars.len(), "Serving history");
                    peer.send(HISTORICAL_DATA_EVENT, json!(bars));
                }
                Err(e) => {
                    peer.send(ERROR_EVENT, json!({ "message": format!("bad history request: {e}") }));
                }
            },
            SUBSCRIBE_EVENT | UNSUBSCRIBE_EVENT => {
                match serde_json::from_value::<SubscriptionIntent>(data) {
                    Ok(intent) if event == SUBSCRIBE_EVENT => {
                        self.subscriptions.insert((intent.symbol, intent.channel));
                    }
                    Ok(intent) => {
                        self.subscriptions.remove(&(intent.symbol, intent.channel));
                    }
                    Err(e) => {
                        peer.send(ERROR_EVENT, json!({ "message": format!("bad subscription: {e}") }));
                    }
                }
            }
            SELECT_COIN_EVENT => {}
            START_TRADING_EVENT => {
                let symbol = data
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                peer.send(
                    TRADING_STATUS_EVENT,
                    json!({ "status": "TRADING_STARTED", "symbol": symbol }),
                );
                self.trading = Some(symbol);
            }
            STOP_TRADING_EVENT => {
                self.trading = None;
                peer.send(TRADING_STATUS_EVENT, json!({ "status": "TRADING_STOPPED" }));
            }
            other => {
                peer.send(ERROR_EVENT, json!({ "message": format!("unknown event '{other}'") }));
            }
        }
    }

    fn tick(&mut self, peer: &MemoryPeer) {
        self.ticks += 1;
        self.trade_id += 1;
        let upward = self.trade_id % 2 == 0;
        self.price = (self.price + if upward { 0.6 } else { -0.4 }).max(1.0);
        let now = now_ms();

        let open_time = interval_open_time(now, self.interval.duration_ms());
        let bar = match self.forming {
            Some(bar) if bar.interval_start == open_time => Bar {
                high: bar.high.max(self.price),
                low: bar.low.min(self.price),
                close: self.price,
                volume: bar.volume + 0.1,
                ..bar
            },
            _ => Bar {
                interval_start: open_time,
                open: self.price,
                high: self.price,
                low: self.price,
                close: self.price,
                volume: 0.1,
            },
        };
        self.forming = Some(bar);

        for (symbol, channel) in &self.subscriptions {
            match channel {
                Channel::Kline => {
                    peer.send(
                        KLINE_UPDATE_EVENT,
                        json!({
                            "symbol": symbol,
                            "interval": self.interval.as_str(),
                            "time": bar.interval_start,
                            "open": bar.open,
                            "high": bar.high,
                            "low": bar.low,
                            "close": bar.close,
                            "volume": bar.volume,
                        }),
                    );
                }
                Channel::Trade => {
                    peer.send(
                        TRADE_UPDATE_EVENT,
                        json!({
                            "symbol": symbol,
                            "id": self.trade_id,
                            "price": self.price,
                            "quantity": 0.12 + (self.trade_id % 5) as f64 * 0.01,
                            "time": now,
                            "isBuyerMaker": !upward,
                        }),
                    );
                }
                Channel::Signal => {
                    if self.trading.is_some() && self.ticks % SIGNAL_EVERY_TICKS == 0 {
                        let side = self.next_side;
                        self.next_side = match side {
                            Side::Buy => Side::Sell,
                            Side::Sell => Side::Buy,
                        };
                        peer.send(
                            TRADING_SIGNAL_EVENT,
                            json!({
                                "symbol": symbol,
                                "action": side,
                                "price": self.price,
                                "source": "simulator",
                            }),
                        );
                    }
                }
                Channel::TradingStatus => {}
            }
        }
    }
}

async fn serve_peer(mut peer: MemoryPeer, config: SimulatorConfig, shutdown: CancellationToken) {
    let mut state = PeerState::new();
    let mut ticker = tokio::time::interval(config.tick_every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            envelope = peer.recv() => match envelope {
                Some(envelope) => state.handle(&peer, &envelope.event, envelope.data),
                None => break,
            },
            _ = ticker.tick() => state.tick(&peer),
        }
    }
    debug!("Simulated peer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_time_aligns_down() {
        assert_eq!(interval_open_time(3_599_999, 3_600_000), 0);
        assert_eq!(interval_open_time(3_600_000, 3_600_000), 3_600_000);
        assert_eq!(interval_open_time(42, 0), 42);
    }

    #[test]
    fn history_is_ordered_valid_and_capped() {
        let hour = Interval::Hour1.duration_ms();
        let end = 1_700_000_000_000;
        let bars = build_history(end - 24 * hour, end, Interval::Hour1);
        assert_eq!(bars.len(), 25);
        assert!(bars.iter().all(Bar::is_valid));
        assert!(bars.windows(2).all(|w| w[1].interval_start - w[0].interval_start == hour));

        let long = build_history(0, end, Interval::Min1);
        assert_eq!(long.len(), MAX_HISTORY_BARS as usize);
    }

    #[test]
    fn inverted_window_has_no_bars() {
        assert!(build_history(10_000_000, 0, Interval::Min1).is_empty());
    }
}
