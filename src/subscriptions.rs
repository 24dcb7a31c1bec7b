//! Live subscription router
//!
//! Long-lived callbacks keyed by (symbol, channel). One dispatcher task per
//! connection decodes inbound stream events and invokes matching callbacks in
//! transport order. Subscriptions survive a lost transport: the router
//! reconnects with capped exponential backoff and replays every subscribe
//! intent on the new connection. An explicit disconnect clears them.

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent, ConnectionManager};
use crate::error::FeedError;
use crate::transport::{
    Envelope, KLINE_UPDATE_EVENT, SELECT_COIN_EVENT, SUBSCRIBE_EVENT, TRADE_UPDATE_EVENT,
    TRADING_SIGNAL_EVENT, TRADING_STATUS_EVENT, UNSUBSCRIBE_EVENT,
};
use crate::types::{normalize_symbol, Bar, Channel, Interval, Signal, TradePrint, TradingStatus};

const BACKOFF_JITTER_RATIO: f64 = 0.20;

/// Decoded live event handed to subscription callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Kline {
        symbol: Option<String>,
        interval: Option<Interval>,
        bar: Bar,
    },
    Trade {
        symbol: Option<String>,
        print: TradePrint,
    },
    TradingStatus {
        symbol: Option<String>,
        status: TradingStatus,
    },
    Signal(Signal),
}

#[derive(Deserialize)]
struct KlineWire {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(flatten)]
    bar: Bar,
}

#[derive(Deserialize)]
struct TradeWire {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(flatten)]
    print: TradePrint,
}

#[derive(Deserialize)]
struct StatusWire {
    status: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl StreamEvent {
    /// Decode a streaming envelope. Non-stream events yield `Ok(None)`.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, FeedError> {
        let data = envelope.data.clone();
        let event = match envelope.event.as_str() {
            KLINE_UPDATE_EVENT => {
                let wire: KlineWire = serde_json::from_value(data)?;
                StreamEvent::Kline {
                    symbol: wire.symbol,
                    interval: wire.interval.as_deref().and_then(Interval::from_str),
                    bar: wire.bar,
                }
            }
            TRADE_UPDATE_EVENT => {
                let wire: TradeWire = serde_json::from_value(data)?;
                StreamEvent::Trade {
                    symbol: wire.symbol,
                    print: wire.print,
                }
            }
            TRADING_STATUS_EVENT => {
                let wire: StatusWire = serde_json::from_value(data)?;
                let status = TradingStatus::from_wire(&wire.status, wire.message.as_deref())
                    .ok_or_else(|| {
                        FeedError::Codec(format!("unknown trading status '{}'", wire.status))
                    })?;
                StreamEvent::TradingStatus {
                    symbol: wire.symbol,
                    status,
                }
            }
            TRADING_SIGNAL_EVENT => StreamEvent::Signal(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn channel(&self) -> Channel {
        match self {
            StreamEvent::Kline { .. } => Channel::Kline,
            StreamEvent::Trade { .. } => Channel::Trade,
            StreamEvent::TradingStatus { .. } => Channel::TradingStatus,
            StreamEvent::Signal(_) => Channel::Signal,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            StreamEvent::Kline { symbol, .. }
            | StreamEvent::Trade { symbol, .. }
            | StreamEvent::TradingStatus { symbol, .. } => symbol.as_deref(),
            StreamEvent::Signal(signal) => Some(signal.symbol.as_str()),
        }
    }

    /// Events without a symbol match every subscription on their channel.
    /// Trading events may name the base asset only ("BTC" for "BTCUSDT").
    fn matches(&self, key: &SubscriptionKey) -> bool {
        self.channel() == key.channel
            && self.symbol().map_or(true, |symbol| {
                symbol.eq_ignore_ascii_case(&key.symbol)
                    || key
                        .symbol
                        .strip_suffix("USDT")
                        .map_or(false, |base| base.eq_ignore_ascii_case(symbol))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub channel: Channel,
}

impl SubscriptionKey {
    fn intent(&self) -> Value {
        json!({ "symbol": self.symbol, "channel": self.channel.as_str() })
    }
}

/// Opaque handle returned by [`SubscriptionRouter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

pub type StreamCallback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Unsubscribes its handle when dropped
#[derive(Debug)]
pub struct SubscriptionGuard {
    router: SubscriptionRouter,
    handle: SubscriptionHandle,
}

impl SubscriptionGuard {
    pub fn new(router: SubscriptionRouter, handle: SubscriptionHandle) -> Self {
        Self { router, handle }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.router.unsubscribe(self.handle);
    }
}

struct Entry {
    id: u64,
    key: SubscriptionKey,
    callback: StreamCallback,
    active: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct SubscriptionRouter {
    inner: Arc<RouterInner>,
}

/// Dispatcher attachment and the keys announced on that connection
#[derive(Default)]
struct Attachment {
    connection_id: Option<u64>,
    announced: HashSet<SubscriptionKey>,
}

struct RouterInner {
    manager: ConnectionManager,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    attached: Mutex<Attachment>,
    /// Cancels the reconnect task currently running, if any
    reconnecting: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl SubscriptionRouter {
    /// Must be called inside a tokio runtime; spawns the lifecycle supervisor
    pub fn new(manager: ConnectionManager) -> Self {
        let events = manager.events();
        let inner = Arc::new(RouterInner {
            manager,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            attached: Mutex::new(Attachment::default()),
            reconnecting: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(supervise(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));
        Self { inner }
    }

    /// Register `callback` for events on (`symbol`, `channel`)
    pub async fn subscribe<F>(
        &self,
        symbol: &str,
        channel: Channel,
        callback: F,
    ) -> Result<SubscriptionHandle, FeedError>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let key = SubscriptionKey {
            symbol: normalize_symbol(symbol)?,
            channel,
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.entries.lock().push(Entry {
            id,
            key: key.clone(),
            callback: Arc::new(callback),
            active: Arc::new(AtomicBool::new(true)),
        });
        let handle = SubscriptionHandle(id);

        let connection = match self.inner.manager.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                self.remove(handle);
                return Err(e);
            }
        };
        self.inner.attach(&connection);
        if let Err(e) = self.inner.announce(&connection, &key) {
            self.remove(handle);
            return Err(e);
        }

        info!(
            symbol = %key.symbol,
            channel = %key.channel,
            subscription = id,
            "Subscribed"
        );
        Ok(handle)
    }

    /// Remove exactly this subscription. No callback invocation starts after
    /// this returns. Returns false for an unknown handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some((key, last_for_key)) = self.remove(handle) else {
            return false;
        };
        if last_for_key {
            if let Some(connection) = self.inner.manager.current() {
                self.inner.retract(&connection, &key);
            }
        }
        info!(
            symbol = %key.symbol,
            channel = %key.channel,
            subscription = handle.0,
            "Unsubscribed"
        );
        true
    }

    fn remove(&self, handle: SubscriptionHandle) -> Option<(SubscriptionKey, bool)> {
        let mut entries = self.inner.entries.lock();
        let index = entries.iter().position(|e| e.id == handle.0)?;
        let entry = entries.remove(index);
        entry.active.store(false, Ordering::SeqCst);
        let last_for_key = !entries.iter().any(|e| e.key == entry.key);
        Some((entry.key, last_for_key))
    }

    /// Tell the backend which symbol is in focus. Existing subscriptions stay.
    pub async fn select_symbol(&self, symbol: &str) -> Result<String, FeedError> {
        let symbol = normalize_symbol(symbol)?;
        let connection = self.inner.manager.connect().await?;
        self.inner.attach(&connection);
        connection.send(SELECT_COIN_EVENT, json!({ "symbol": symbol }))?;
        info!(symbol = %symbol, "Selected symbol");
        Ok(symbol)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Distinct (symbol, channel) pairs with at least one subscription
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let entries = self.inner.entries.lock();
        let mut keys: Vec<SubscriptionKey> = Vec::new();
        for entry in entries.iter() {
            if !keys.contains(&entry.key) {
                keys.push(entry.key.clone());
            }
        }
        keys
    }

    /// Drop every subscription without sending unsubscribe intents
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Stop background tasks and drop every subscription
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.clear();
    }
}

impl fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl RouterInner {
    /// Attach the dispatcher to `connection` if it is not already, then
    /// announce every key not yet sent on it.
    fn attach(self: &Arc<Self>, connection: &Connection) {
        let reattached = {
            let mut attached = self.attached.lock();
            if attached.connection_id == Some(connection.id()) {
                return;
            }
            let previous = attached.connection_id.replace(connection.id());
            attached.announced.clear();
            previous.is_some()
        };

        let events = connection.listen();
        tokio::spawn(dispatch(Arc::downgrade(self), connection.clone(), events));
        debug!(connection_id = connection.id(), "Dispatcher attached");

        let keys: Vec<SubscriptionKey> = {
            let entries = self.entries.lock();
            let mut keys: Vec<SubscriptionKey> = Vec::new();
            for entry in entries.iter() {
                if !keys.contains(&entry.key) {
                    keys.push(entry.key.clone());
                }
            }
            keys
        };
        let mut replayed = 0;
        for key in &keys {
            match self.announce(connection, key) {
                Ok(true) => replayed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(symbol = %key.symbol, channel = %key.channel, error = %e, "Failed to replay subscription");
                }
            }
        }
        if reattached && replayed > 0 {
            info!(
                connection_id = connection.id(),
                count = replayed,
                "Replayed subscriptions on new connection"
            );
        }
    }

    /// Send the subscribe intent for `key` unless this connection already has it.
    /// Returns true when an intent was sent.
    fn announce(&self, connection: &Connection, key: &SubscriptionKey) -> Result<bool, FeedError> {
        let mut attached = self.attached.lock();
        if attached.connection_id != Some(connection.id()) || attached.announced.contains(key) {
            return Ok(false);
        }
        connection.send(SUBSCRIBE_EVENT, key.intent())?;
        attached.announced.insert(key.clone());
        Ok(true)
    }

    /// Send the unsubscribe intent for `key` if it was announced on `connection`
    fn retract(&self, connection: &Connection, key: &SubscriptionKey) {
        let mut attached = self.attached.lock();
        if attached.connection_id != Some(connection.id()) || !attached.announced.remove(key) {
            return;
        }
        if let Err(e) = connection.send(UNSUBSCRIBE_EVENT, key.intent()) {
            debug!(error = %e, "Unsubscribe intent not sent");
        }
    }

    /// Invoke matching callbacks. Stops as soon as `connection` goes down.
    fn deliver(&self, connection: &Connection, envelope: &Envelope) {
        let event = match StreamEvent::decode(envelope) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(event = %envelope.event, error = %e, "Dropping undecodable stream event");
                return;
            }
        };

        let targets: Vec<(StreamCallback, Arc<AtomicBool>)> = self
            .entries
            .lock()
            .iter()
            .filter(|e| event.matches(&e.key))
            .map(|e| (Arc::clone(&e.callback), Arc::clone(&e.active)))
            .collect();

        for (callback, active) in targets {
            if !connection.is_live() {
                return;
            }
            if active.load(Ordering::SeqCst) {
                callback(&event);
            }
        }
    }

    fn clear(&self) {
        let removed: Vec<Entry> = std::mem::take(&mut *self.entries.lock());
        for entry in &removed {
            entry.active.store(false, Ordering::SeqCst);
        }
        *self.attached.lock() = Attachment::default();
        if let Some(token) = self.reconnecting.lock().take() {
            token.cancel();
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Cleared subscriptions");
        }
    }

    fn has_subscriptions(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.reconnecting.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(reconnect(Arc::downgrade(self), token));
    }
}

/// Invoke callbacks for one connection's events, in arrival order
async fn dispatch(
    router: Weak<RouterInner>,
    connection: Connection,
    mut events: broadcast::Receiver<Envelope>,
) {
    loop {
        tokio::select! {
            biased;
            _ = connection.closed() => break,
            received = events.recv() => match received {
                Ok(envelope) => {
                    if !connection.is_live() {
                        break;
                    }
                    let Some(router) = router.upgrade() else { break };
                    router.deliver(&connection, &envelope);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection_id = connection.id(), skipped, "Stream dispatcher lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!(connection_id = connection.id(), "Dispatcher detached");
}

/// React to connection lifecycle events
async fn supervise(
    router: Weak<RouterInner>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => received,
        };
        let Some(inner) = router.upgrade() else { break };
        match received {
            Ok(ConnectionEvent::Connected { .. }) => {
                if let Some(connection) = inner.manager.current() {
                    inner.attach(&connection);
                }
            }
            Ok(ConnectionEvent::Lost {
                connection_id,
                reason,
            }) => {
                if inner.has_subscriptions() {
                    warn!(connection_id, reason = %reason, "Live stream lost, reconnecting");
                    inner.spawn_reconnect();
                }
            }
            Ok(ConnectionEvent::Closed) => inner.clear(),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Connection event listener lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Retry `connect()` with backoff until the stream is back or nobody cares
async fn reconnect(router: Weak<RouterInner>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        let (delay, manager) = {
            let Some(inner) = router.upgrade() else { return };
            if cancel.is_cancelled() || !inner.has_subscriptions() {
                return;
            }
            let config = inner.manager.config();
            (
                backoff_with_jitter(attempt, config.reconnect_base_delay, config.reconnect_max_delay),
                inner.manager.clone(),
            )
        };

        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying feed connection with exponential backoff + jitter"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match manager.connect().await {
            Ok(connection) => {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(inner) = router.upgrade() {
                    inner.attach(&connection);
                }
                info!(connection_id = connection.id(), "Live stream restored");
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Capped exponential backoff with +/-20% jitter
fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let capped_attempt = attempt.min(16);
    let max_ms = (max.as_millis() as u64).max(1);
    let base_ms = base.as_millis() as u64;
    let bounded = base_ms
        .saturating_mul(1u64 << capped_attempt)
        .min(max_ms)
        .max(1);

    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_micros() as f64;
    let unit = (micros % 1_000.0) / 1_000.0;
    let jitter = 1.0 + ((unit * 2.0) - 1.0) * BACKOFF_JITTER_RATIO;
    let ms = ((bounded as f64) * jitter).round().clamp(1.0, max_ms as f64) as u64;
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportConfig;
    use crate::transport::{MemoryConnector, MemoryPeer};
    use tokio::sync::mpsc;

    async fn router() -> (SubscriptionRouter, ConnectionManager, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (connector, peers) = MemoryConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector), TransportConfig::default());
        (SubscriptionRouter::new(manager.clone()), manager, peers)
    }

    fn kline(symbol: &str, ts: i64, close: f64) -> Value {
        json!({
            "symbol": symbol,
            "interval": "1h",
            "time": ts,
            "open": close,
            "high": close,
            "low": close,
            "close": close,
            "volume": 1.0
        })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let first = backoff_with_jitter(0, base, max);
        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1_200));
        let late = backoff_with_jitter(30, base, max);
        assert!(late >= Duration::from_secs(48) && late <= max);
    }

    #[test]
    fn decodes_stream_events() {
        let envelope = Envelope::new(KLINE_UPDATE_EVENT, kline("BTCUSDT", 1_700_000_000, 5.0));
        let Some(StreamEvent::Kline { symbol, interval, bar }) =
            StreamEvent::decode(&envelope).unwrap()
        else {
            panic!("expected kline");
        };
        assert_eq!(symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(interval, Some(Interval::Hour1));
        assert_eq!(bar.interval_start, 1_700_000_000);

        let status = Envelope::new(
            TRADING_STATUS_EVENT,
            json!({ "status": "TRADING_STOPPED", "symbol": "BTC" }),
        );
        assert_eq!(
            StreamEvent::decode(&status).unwrap().unwrap().channel(),
            Channel::TradingStatus
        );

        let other = Envelope::new("historical_data", json!([]));
        assert_eq!(StreamEvent::decode(&other).unwrap(), None);
    }

    #[test]
    fn symbolless_events_match_by_channel() {
        let event = StreamEvent::TradingStatus {
            symbol: None,
            status: TradingStatus::Started,
        };
        let key = SubscriptionKey {
            symbol: "ETHUSDT".to_string(),
            channel: Channel::TradingStatus,
        };
        assert!(event.matches(&key));
        let kline_key = SubscriptionKey {
            channel: Channel::Kline,
            ..key
        };
        assert!(!event.matches(&kline_key));
    }

    #[tokio::test]
    async fn first_and_last_subscription_drive_intents() {
        let (router, _manager, mut peers) = router().await;

        let a = router.subscribe("btcusdt", Channel::Kline, |_| {}).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let intent = peer.expect(SUBSCRIBE_EVENT).await.unwrap();
        assert_eq!(intent.data, json!({ "symbol": "BTCUSDT", "channel": "kline" }));

        let b = router.subscribe("BTCUSDT", Channel::Kline, |_| {}).await.unwrap();
        assert_eq!(router.subscription_count(), 2);
        assert_eq!(router.keys().len(), 1);

        assert!(router.unsubscribe(a));
        assert!(!router.unsubscribe(a));
        assert!(router.unsubscribe(b));
        // The second subscribe sent nothing, so the next event is the unsubscribe
        let next = peer.recv().await.unwrap();
        assert_eq!(next.event, UNSUBSCRIBE_EVENT);
        assert_eq!(router.subscription_count(), 0);
    }

    #[tokio::test]
    async fn select_symbol_keeps_subscriptions() {
        let (router, _manager, mut peers) = router().await;
        router.subscribe("BTCUSDT", Channel::Trade, |_| {}).await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        assert_eq!(router.select_symbol("ethusdt").await.unwrap(), "ETHUSDT");
        let selected = peer.expect(SELECT_COIN_EVENT).await.unwrap();
        assert_eq!(selected.data["symbol"], "ETHUSDT");
        assert_eq!(router.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_transport_replays_subscriptions() {
        let (router, _manager, mut peers) = router().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .subscribe("BTCUSDT", Channel::Kline, move |event| {
                let _ = tx.send(event.clone());
            })
            .await
            .unwrap();

        let mut first = peers.recv().await.unwrap();
        first.expect(SUBSCRIBE_EVENT).await.unwrap();
        first.sever();

        let mut second = peers.recv().await.unwrap();
        let replayed = second.expect(SUBSCRIBE_EVENT).await.unwrap();
        assert_eq!(replayed.data["symbol"], "BTCUSDT");

        second.send(KLINE_UPDATE_EVENT, kline("BTCUSDT", 1_700_000_000_000, 3.0));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel(), Channel::Kline);
    }

    #[tokio::test]
    async fn disconnect_stops_queued_deliveries() {
        use std::sync::atomic::AtomicUsize;

        let (router, manager, mut peers) = router().await;
        let first_calls = Arc::new(AtomicUsize::new(0));
        let sibling_calls = Arc::new(AtomicUsize::new(0));

        let calls = Arc::clone(&first_calls);
        let closer = manager.clone();
        router
            .subscribe("BTCUSDT", Channel::Kline, move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    closer.disconnect();
                }
            })
            .await
            .unwrap();
        let calls = Arc::clone(&sibling_calls);
        router
            .subscribe("BTCUSDT", Channel::Kline, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        let peer = peers.recv().await.unwrap();
        for n in 0..50 {
            peer.send(KLINE_UPDATE_EVENT, kline("BTCUSDT", 1_700_000_000_000 + n, 1.0));
        }

        while first_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        // The sibling was next in line for the very event that disconnected
        assert_eq!(sibling_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resubscribe_after_idle_loss_announces_once() {
        let (router, manager, mut peers) = router().await;
        let handle = router.subscribe("BTCUSDT", Channel::Kline, |_| {}).await.unwrap();
        let mut first = peers.recv().await.unwrap();
        first.expect(SUBSCRIBE_EVENT).await.unwrap();
        assert!(router.unsubscribe(handle));
        first.expect(UNSUBSCRIBE_EVENT).await.unwrap();

        // Lost with nothing subscribed: no reconnect is scheduled
        first.sever();
        while manager.state() != crate::connection::ConnectionState::Disconnected {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        router.subscribe("BTCUSDT", Channel::Kline, |_| {}).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        router.select_symbol("BTCUSDT").await.unwrap();

        let mut second = peers.recv().await.unwrap();
        assert_eq!(second.recv().await.unwrap().event, SUBSCRIBE_EVENT);
        assert_eq!(second.recv().await.unwrap().event, SELECT_COIN_EVENT);
    }

    #[tokio::test]
    async fn explicit_disconnect_clears_subscriptions() {
        let (router, manager, mut peers) = router().await;
        router.subscribe("BTCUSDT", Channel::Kline, |_| {}).await.unwrap();
        let _peer = peers.recv().await.unwrap();

        manager.disconnect();
        while router.subscription_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(router.subscription_count(), 0);
    }
}
