//! In-process loopback connector
//!
//! Every successful `open()` hands the far end of the link to the owner of the
//! peer receiver, which then plays the server. Used by the simulated backend in
//! the binary and throughout the tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connector, Envelope, Link};
use crate::error::FeedError;

#[derive(Debug, Clone)]
enum HandshakeMode {
    Accept,
    Hang,
    Refuse(String),
}

#[derive(Debug)]
pub struct MemoryConnector {
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    mode: Mutex<HandshakeMode>,
    handshakes: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers_tx,
            mode: Mutex::new(HandshakeMode::Accept),
            handshakes: AtomicUsize::new(0),
        };
        (connector, peers_rx)
    }

    /// Complete future handshakes normally
    pub fn accept(&self) {
        *self.mode.lock() = HandshakeMode::Accept;
    }

    /// Never complete future handshakes
    pub fn hang(&self) {
        *self.mode.lock() = HandshakeMode::Hang;
    }

    /// Fail future handshakes with a transport error
    pub fn refuse(&self, reason: &str) {
        *self.mode.lock() = HandshakeMode::Refuse(reason.to_string());
    }

    /// Number of handshakes started so far
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self) -> Result<Link, FeedError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().clone();
        match mode {
            HandshakeMode::Hang => std::future::pending().await,
            HandshakeMode::Refuse(reason) => Err(FeedError::Transport(reason)),
            HandshakeMode::Accept => {
                let (client_tx, from_client) = mpsc::unbounded_channel();
                let (to_client, client_rx) = mpsc::unbounded_channel();
                let shutdown = CancellationToken::new();
                let peer = MemoryPeer {
                    from_client,
                    to_client: Some(to_client),
                    shutdown: shutdown.clone(),
                };
                self.peers_tx
                    .send(peer)
                    .map_err(|_| FeedError::Transport("memory server is gone".to_string()))?;
                Ok(Link {
                    outbound: client_tx,
                    inbound: client_rx,
                    shutdown,
                })
            }
        }
    }
}

/// Server side of one loopback connection
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Envelope>,
    to_client: Option<mpsc::UnboundedSender<Envelope>>,
    shutdown: CancellationToken,
}

impl MemoryPeer {
    /// Next event sent by the client, `None` once the client closed the link
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            biased;
            envelope = self.from_client.recv() => envelope,
            _ = self.shutdown.cancelled() => None,
        }
    }

    /// Skip client events until one named `event` arrives
    pub async fn expect(&mut self, event: &str) -> Option<Envelope> {
        while let Some(envelope) = self.recv().await {
            if envelope.event == event {
                return Some(envelope);
            }
        }
        None
    }

    /// Push an event to the client; false once the link is gone
    pub fn send(&self, event: &str, data: Value) -> bool {
        match &self.to_client {
            Some(tx) => tx.send(Envelope::new(event, data)).is_ok(),
            None => false,
        }
    }

    /// Simulate a transport failure: the client sees its inbound stream end
    pub fn sever(&mut self) {
        self.to_client = None;
    }

    /// True once the client asked to close the link
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
