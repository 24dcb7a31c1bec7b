//! End-to-end behavior of the feed core against the in-process backend

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use chartfeed::paper::{PaperConfig, PaperExecutor, PaperLoop, PaperPhase};
use chartfeed::simulator::{spawn_simulator, SimulatorConfig};
use chartfeed::transport::{
    MemoryConnector, MemoryPeer, GET_HISTORICAL_DATA_EVENT, HISTORICAL_DATA_EVENT,
    KLINE_UPDATE_EVENT, SUBSCRIBE_EVENT, TRADE_UPDATE_EVENT, TRADING_SIGNAL_EVENT,
};
use chartfeed::{
    Channel, ConnectionManager, Correlator, ExecutionError, FeedError, Interval, RecordingSink,
    Session, SessionConfig, StreamEvent, SubscriptionRouter, Topic, TransportConfig,
};

fn manager() -> (
    ConnectionManager,
    Arc<MemoryConnector>,
    mpsc::UnboundedReceiver<MemoryPeer>,
) {
    let (connector, peers) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let manager = ConnectionManager::new(connector.clone(), TransportConfig::default());
    (manager, connector, peers)
}

fn bar_json(ts: i64, close: f64) -> Value {
    json!({ "time": ts, "open": close, "high": close, "low": close, "close": close, "volume": 1.0 })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn concurrent_connects_resolve_to_one_connection() {
    let (manager, connector, _peers) = manager();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        })
        .collect();

    let mut ids = Vec::new();
    for attempt in attempts {
        ids.push(assert_ok!(attempt.await.unwrap()).id());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(connector.handshake_count(), 1);
}

#[tokio::test]
async fn duplicate_topic_is_rejected_while_first_proceeds() {
    let (manager, _connector, mut peers) = manager();
    let correlator = Correlator::new(manager);

    let first = tokio::spawn({
        let correlator = correlator.clone();
        async move {
            correlator
                .request(Topic::HISTORY, json!({ "n": 1 }), Duration::from_secs(5))
                .await
        }
    });

    let mut peer = peers.recv().await.unwrap();
    let request = peer.expect(GET_HISTORICAL_DATA_EVENT).await.unwrap();
    assert_eq!(request.data["n"], 1);

    let second = correlator
        .request(Topic::HISTORY, json!({ "n": 2 }), Duration::from_secs(5))
        .await;
    assert_eq!(
        assert_err!(second),
        FeedError::RequestInProgress {
            topic: "historical_data".to_string()
        }
    );

    peer.send(HISTORICAL_DATA_EVENT, json!([bar_json(1, 1.0)]));
    let reply = assert_ok!(first.await.unwrap());
    assert_eq!(reply[0]["close"], 1.0);
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_times_out_at_deadline_and_ignores_late_reply() {
    let (manager, _connector, mut peers) = manager();
    let correlator = Correlator::new(manager.clone());

    let started = Instant::now();
    let pending = tokio::spawn({
        let correlator = correlator.clone();
        async move {
            correlator
                .request(Topic::HISTORY, Value::Null, Duration::from_secs(30))
                .await
        }
    });
    let mut peer = peers.recv().await.unwrap();
    peer.expect(GET_HISTORICAL_DATA_EVENT).await.unwrap();

    let outcome = pending.await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_secs(30));
    assert_eq!(
        outcome,
        Err(FeedError::RequestTimeout {
            topic: "historical_data".to_string(),
            timeout_ms: 30_000
        })
    );

    let connection = manager.current().unwrap();
    assert_eq!(connection.listener_count(), 0);
    assert_eq!(correlator.pending_count(), 0);

    // The late reply reaches the connection but nobody is waiting for it
    let mut probe = connection.listen();
    peer.send(HISTORICAL_DATA_EVENT, json!([bar_json(1, 99.0)]));
    assert_eq!(probe.recv().await.unwrap().event, HISTORICAL_DATA_EVENT);
    drop(probe);
    assert_eq!(correlator.pending_count(), 0);

    // A fresh request only sees its own reply
    let fresh = tokio::spawn({
        let correlator = correlator.clone();
        async move {
            correlator
                .request(Topic::HISTORY, Value::Null, Duration::from_secs(30))
                .await
        }
    });
    peer.expect(GET_HISTORICAL_DATA_EVENT).await.unwrap();
    peer.send(HISTORICAL_DATA_EVENT, json!([bar_json(2, 7.0)]));
    let reply = assert_ok!(fresh.await.unwrap());
    assert_eq!(reply[0]["close"], 7.0);
}

#[tokio::test]
async fn unsubscribe_isolates_sibling_subscription() {
    let (manager, _connector, mut peers) = manager();
    let router = SubscriptionRouter::new(manager);

    let (a_tx, mut a_rx) = mpsc::unbounded_channel::<StreamEvent>();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel::<StreamEvent>();
    let a = router
        .subscribe("BTCUSDT", Channel::Kline, move |event| {
            let _ = a_tx.send(event.clone());
        })
        .await
        .unwrap();
    router
        .subscribe("BTCUSDT", Channel::Kline, move |event| {
            let _ = b_tx.send(event.clone());
        })
        .await
        .unwrap();

    let mut peer = peers.recv().await.unwrap();
    peer.expect(SUBSCRIBE_EVENT).await.unwrap();

    let mut tick = bar_json(1_700_000_000_000, 1.0);
    tick["symbol"] = json!("BTCUSDT");
    peer.send(KLINE_UPDATE_EVENT, tick.clone());
    assert!(a_rx.recv().await.is_some());
    assert!(b_rx.recv().await.is_some());

    assert!(router.unsubscribe(a));
    peer.send(KLINE_UPDATE_EVENT, tick);
    assert!(b_rx.recv().await.is_some());
    assert!(a_rx.try_recv().is_err());
    assert_eq!(router.subscription_count(), 1);
}

#[tokio::test]
async fn trade_tape_keeps_newest_prints() {
    let (connector, mut peers) = MemoryConnector::new();
    let config = SessionConfig {
        trade_capacity: 3,
        ..SessionConfig::default()
    };
    let session = Session::open(config, Arc::new(connector)).await.unwrap();
    let tape = session.trade_tape("BTCUSDT").await.unwrap();

    let mut peer = peers.recv().await.unwrap();
    peer.expect(SUBSCRIBE_EVENT).await.unwrap();
    for id in ["A", "B", "C", "D"] {
        peer.send(
            TRADE_UPDATE_EVENT,
            json!({
                "symbol": "BTCUSDT",
                "id": id,
                "price": 100.0,
                "quantity": 1.0,
                "time": 1_700_000_000_000i64,
                "isBuyerMaker": false
            }),
        );
    }

    wait_until(|| tape.snapshot().first().map(|p| p.id.as_str()) == Some("D")).await;
    let ids: Vec<String> = tape.snapshot().iter().map(|p| p.id.clone()).collect();
    assert_eq!(ids, vec!["D", "C", "B"]);
    session.close();
}

#[tokio::test]
async fn remote_signals_drive_paper_execution() {
    let (connector, mut peers) = MemoryConnector::new();
    let session = Session::open(SessionConfig::default(), Arc::new(connector))
        .await
        .unwrap();
    let (source, _guard) = session.remote_signals("BTCUSDT").await.unwrap();

    let mut peer = peers.recv().await.unwrap();
    peer.expect(SUBSCRIBE_EVENT).await.unwrap();

    let (_price_tx, prices) = tokio::sync::watch::channel(None);
    let (paper, mut snapshots) =
        PaperLoop::new(PaperExecutor::new(PaperConfig::default()), source, prices);
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(paper.run(shutdown.clone()));

    for (action, price) in [("BUY", 100.0), ("SELL", 110.0), ("SELL", 110.0)] {
        peer.send(
            TRADING_SIGNAL_EVENT,
            json!({ "symbol": "BTCUSDT", "action": action, "price": price, "source": "strategy" }),
        );
    }

    loop {
        snapshots.changed().await.unwrap();
        let snapshot = snapshots.borrow().clone();
        if snapshot.accepted + snapshot.rejected == 3 {
            assert_eq!(snapshot.balance, 10_010.0);
            assert_eq!(snapshot.position, 0.0);
            assert_eq!(snapshot.phase, PaperPhase::Idle);
            assert!(matches!(
                snapshot.last_rejection,
                Some(ExecutionError::InvalidSignalForState { .. })
            ));
            assert_eq!(snapshot.executions[0].signal_source, "strategy");
            break;
        }
    }

    shutdown.cancel();
    running.await.unwrap();
    session.close();
}

#[tokio::test]
async fn chart_loads_from_simulated_backend() {
    let (connector, peers) = MemoryConnector::new();
    let shutdown = CancellationToken::new();
    spawn_simulator(
        peers,
        SimulatorConfig {
            tick_every: Duration::from_millis(10),
        },
        shutdown.clone(),
    );

    let session = Session::open(SessionConfig::default(), Arc::new(connector))
        .await
        .unwrap();
    let chart = session
        .load_chart(
            "btcusdt",
            Interval::Hour1,
            Duration::from_secs(24 * 3_600),
            RecordingSink::default(),
        )
        .await
        .unwrap();
    assert_eq!(chart.symbol(), "BTCUSDT");

    let mut prices = chart.prices();
    prices.changed().await.unwrap();
    assert!(prices.borrow().is_some());

    // Stop the stream so the chart and its sink can be compared at rest
    drop(prices);
    session.close();
    shutdown.cancel();

    let bars = chart.bars();
    assert!(bars.len() == 25 || bars.len() == 26);
    assert!(bars.windows(2).all(|w| w[0].interval_start < w[1].interval_start));
    chart.with_sink(|sink| {
        assert_eq!(sink.full_series_calls, 1);
        assert_eq!(sink.series, bars);
    });
}

#[tokio::test]
async fn close_is_idempotent_and_drops_subscriptions() {
    let (connector, _peers) = MemoryConnector::new();
    let session = Session::open(SessionConfig::default(), Arc::new(connector))
        .await
        .unwrap();
    session
        .router()
        .subscribe("ETHUSDT", Channel::Trade, |_| {})
        .await
        .unwrap();
    assert!(session.is_open());

    session.close();
    session.close();
    assert!(!session.is_open());
    assert_eq!(session.router().subscription_count(), 0);
}
