//! chartfeed binary
//!
//! Opens a feed session, keeps a live chart and trade tape for the configured
//! symbol and runs the paper execution loop until Ctrl-C.
//!
//! Run with `--simulate` to use the in-process backend instead of a server.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chartfeed::config::{AppConfig, SignalMode};
use chartfeed::paper::{PaperExecutor, PaperLoop, PaperSnapshot, RandomSignals, SignalSource};
use chartfeed::simulator::{spawn_simulator, SimulatorConfig};
use chartfeed::telemetry::init_tracing;
use chartfeed::trading::{IndicatorConfig, StartTradingParams};
use chartfeed::transport::{Connector, MemoryConnector, WsConnector};
use chartfeed::{RecordingSink, Session};

const SUMMARY_EVERY_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging.filter, config.logging.json)?;

    let simulate = std::env::args().any(|arg| arg == "--simulate");
    info!(config = %config, simulate, "Starting chartfeed");

    let shutdown = CancellationToken::new();
    let connector: Arc<dyn Connector> = if simulate {
        let (connector, peers) = MemoryConnector::new();
        spawn_simulator(peers, SimulatorConfig::default(), shutdown.child_token());
        Arc::new(connector)
    } else {
        Arc::new(WsConnector::new(&config.transport.url).with_ping_interval(config.ping_interval()))
    };

    let session = Session::open(config.session_config(), connector)
        .await
        .context("Failed to open feed session")?;

    let symbol = config.market.symbol.clone();
    let chart = session
        .load_chart(&symbol, config.interval()?, config.lookback(), RecordingSink::default())
        .await
        .with_context(|| format!("Failed to load chart for {symbol}"))?;
    let tape = session
        .trade_tape(&symbol)
        .await
        .context("Failed to subscribe trade tape")?;

    let mut trading = session.trading();
    trading
        .track(&symbol)
        .await
        .context("Failed to track trading status")?;

    let mut signal_guard = None;
    let paper = if config.paper.enabled {
        let executor = PaperExecutor::new(config.paper_config());
        let running = match config.signal_mode()? {
            SignalMode::Random => spawn_paper(
                executor,
                RandomSignals::new(chart.symbol(), config.signal_interval()),
                chart.prices(),
                shutdown.child_token(),
            ),
            SignalMode::Remote => {
                let (source, guard) = session
                    .remote_signals(chart.symbol())
                    .await
                    .context("Failed to subscribe trading signals")?;
                signal_guard = Some(guard);
                let params = StartTradingParams::new(chart.symbol(), IndicatorConfig::default())?;
                trading.start_trading(&params).await?;
                spawn_paper(executor, source, chart.prices(), shutdown.child_token())
            }
        };
        Some(running)
    } else {
        None
    };

    let mut summary = tokio::time::interval(Duration::from_secs(SUMMARY_EVERY_SECS));
    summary.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutdown requested");
                break;
            }
            _ = summary.tick() => {
                let latest_trade = tape.snapshot().first().map(|print| print.price);
                let paper_state = paper.as_ref().map(|(_, snapshots)| snapshots.borrow().clone());
                info!(
                    symbol = %chart.symbol(),
                    bars = chart.bars().len(),
                    last_close = ?chart.last_close(),
                    trades = tape.len(),
                    latest_trade = ?latest_trade,
                    status = %trading.status(),
                    balance = ?paper_state.as_ref().map(|s| s.balance),
                    position = ?paper_state.as_ref().map(|s| s.position),
                    "Feed summary"
                );
            }
        }
    }

    if config.paper.enabled && config.signal_mode()? == SignalMode::Remote {
        if let Err(e) = trading.stop_trading().await {
            warn!(error = %e, "Failed to stop remote trading");
        }
    }

    shutdown.cancel();
    if let Some((handle, _)) = paper {
        match handle.await {
            Ok(executor) => {
                let snapshot = executor.snapshot();
                info!(
                    balance = snapshot.balance,
                    position = snapshot.position,
                    accepted = snapshot.accepted,
                    rejected = snapshot.rejected,
                    "Paper trading finished"
                );
            }
            Err(e) => warn!(error = %e, "Paper loop task failed"),
        }
    }

    drop(signal_guard);
    drop(trading);
    drop(tape);
    drop(chart);
    session.close();
    Ok(())
}

fn spawn_paper<S>(
    executor: PaperExecutor,
    source: S,
    prices: watch::Receiver<Option<f64>>,
    shutdown: CancellationToken,
) -> (JoinHandle<PaperExecutor>, watch::Receiver<PaperSnapshot>)
where
    S: SignalSource + 'static,
{
    let (paper, snapshots) = PaperLoop::new(executor, source, prices);
    (tokio::spawn(paper.run(shutdown)), snapshots)
}
