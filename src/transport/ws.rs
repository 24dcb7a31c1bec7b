//! Websocket connector
//!
//! Opens a tokio-tungstenite client connection and bridges it to a [`Link`]
//! with a pump task that forwards frames both ways and keeps the socket alive
//! with periodic pings.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Connector, Envelope, Link};
use crate::error::FeedError;

const DEFAULT_PING_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    ping_interval: Duration,
}

impl WsConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval.max(Duration::from_millis(100));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self) -> Result<Link, FeedError> {
        info!(url = %self.url, "Connecting to feed WebSocket");
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        info!(url = %self.url, "Connected to feed WebSocket");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let shutdown = CancellationToken::new();
        let pump_shutdown = shutdown.clone();
        let ping_every = self.ping_interval;

        tokio::spawn(async move {
            let (mut write, mut read) = ws_stream.split();
            let mut ping_interval = tokio::time::interval(ping_every);
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ping_interval.tick().await;

            let reason: &'static str = loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                                Ok(envelope) => {
                                    if inbound_tx.send(envelope).is_err() {
                                        break "receiver_dropped";
                                    }
                                }
                                Err(e) => warn!(error = %e, "Dropping undecodable feed frame"),
                            },
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!("Feed WebSocket closed by server");
                                break "remote_close";
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "Feed WebSocket error");
                                break "stream_error";
                            }
                            None => {
                                info!("Feed WebSocket stream ended");
                                break "stream_ended";
                            }
                            _ => {}
                        }
                    }

                    outgoing = outbound_rx.recv() => {
                        let Some(envelope) = outgoing else {
                            let _ = write.send(Message::Close(None)).await;
                            break "sender_dropped";
                        };
                        let text = match envelope.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(event = %envelope.event, error = %e, "Failed to encode outbound event");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "Feed WebSocket send failed");
                            break "send_failed";
                        }
                    }

                    _ = ping_interval.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!(error = %e, "Feed WebSocket ping failed");
                            break "ping_send_failed";
                        }
                    }

                    _ = pump_shutdown.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break "shutdown";
                    }
                }
            };

            debug!(reason, "Feed WebSocket pump exited");
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown,
        })
    }
}
