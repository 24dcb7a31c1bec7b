//! Transport connection manager
//!
//! Owns the single duplex connection of a session. `connect()` is idempotent:
//! a live connection is returned as-is, an attempt in flight is shared by every
//! caller, and only otherwise is a new handshake started. Attempts run in their
//! own task so a caller that gives up does not abandon the handshake for the
//! others.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::transport::{Connector, Envelope};

/// Runtime transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for one handshake
    pub connect_timeout: Duration,
    /// Default deadline for correlated requests
    pub request_timeout: Duration,
    /// Inbound broadcast buffer per connection
    pub event_buffer: usize,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            event_buffer: 1024,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Lifecycle notifications published by the manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting { attempt: u64 },
    Connected { connection_id: u64, attempt: u64 },
    Failed { attempt: u64, error: FeedError },
    /// The transport of a live connection went away on its own
    Lost { connection_id: u64, reason: String },
    /// `disconnect()` tore the connection down
    Closed,
}

type PendingConnect = Shared<BoxFuture<'static, Result<Connection, FeedError>>>;

enum Slot {
    Disconnected,
    Connecting {
        attempt: u64,
        pending: PendingConnect,
        abort: CancellationToken,
    },
    Connected(Connection),
    Failed(FeedError),
}

/// Cheap handle to one established connection.
///
/// Handles are only ever obtained from [`ConnectionManager::connect`]; once the
/// connection dies every handle reports `is_live() == false` and refuses sends.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: broadcast::Sender<Envelope>,
    closed: CancellationToken,
    link_shutdown: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queue one event for the server
    pub fn send(&self, event: &str, data: Value) -> Result<(), FeedError> {
        if !self.is_live() {
            return Err(FeedError::ConnectionLost(format!(
                "connection {} is closed",
                self.inner.id
            )));
        }
        self.inner
            .outbound
            .send(Envelope::new(event, data))
            .map_err(|_| FeedError::ConnectionLost("transport is gone".to_string()))
    }

    /// Subscribe to every inbound event from now on
    pub fn listen(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    /// Number of inbound listeners currently attached
    pub fn listener_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    pub fn is_live(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection is lost or closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    fn close(&self) {
        self.inner.closed.cancel();
        self.inner.link_shutdown.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    slot: Mutex<Slot>,
    events: broadcast::Sender<ConnectionEvent>,
    attempts: AtomicU64,
    connection_ids: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                config,
                slot: Mutex::new(Slot::Disconnected),
                events,
                attempts: AtomicU64::new(0),
                connection_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Return the live connection, join the attempt in flight, or start one
    pub async fn connect(&self) -> Result<Connection, FeedError> {
        let pending = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Connected(connection) if connection.is_live() => {
                    return Ok(connection.clone());
                }
                Slot::Connecting { pending, .. } => pending.clone(),
                _ => {
                    let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let abort = CancellationToken::new();
                    let pending = ManagerInner::start_attempt(&self.inner, attempt, abort.clone());
                    *slot = Slot::Connecting {
                        attempt,
                        pending: pending.clone(),
                        abort,
                    };
                    pending
                }
            }
        };
        pending.await
    }

    /// Tear down the active connection or attempt. No-op when already down.
    pub fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Disconnected);
        match previous {
            Slot::Connected(connection) => {
                info!(connection_id = connection.id(), "Disconnecting feed connection");
                connection.close();
            }
            Slot::Connecting { attempt, abort, .. } => {
                info!(attempt, "Abandoning connection attempt on disconnect");
                abort.cancel();
            }
            Slot::Disconnected | Slot::Failed(_) => return,
        }
        let _ = self.inner.events.send(ConnectionEvent::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.inner.slot.lock() {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Connected(connection) if connection.is_live() => ConnectionState::Connected,
            Slot::Connected(_) => ConnectionState::Disconnected,
            Slot::Failed(_) => ConnectionState::Failed,
        }
    }

    /// Error of the last failed attempt, if the manager is in the failed state
    pub fn last_error(&self) -> Option<FeedError> {
        match &*self.inner.slot.lock() {
            Slot::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Current live connection without triggering a handshake
    pub fn current(&self) -> Option<Connection> {
        match &*self.inner.slot.lock() {
            Slot::Connected(connection) if connection.is_live() => Some(connection.clone()),
            _ => None,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of handshake attempts started so far
    pub fn handshake_count(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connector", &self.inner.connector.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ManagerInner {
    fn start_attempt(this: &Arc<Self>, attempt: u64, abort: CancellationToken) -> PendingConnect {
        let _ = this.events.send(ConnectionEvent::Connecting { attempt });
        let handle = tokio::spawn(Self::run_attempt(Arc::clone(this), attempt, abort));
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FeedError::Transport(format!("connect task failed: {e}"))),
            }
        }
        .boxed()
        .shared()
    }

    async fn run_attempt(
        this: Arc<Self>,
        attempt: u64,
        abort: CancellationToken,
    ) -> Result<Connection, FeedError> {
        let deadline = this.config.connect_timeout;
        info!(
            attempt,
            connector = this.connector.name(),
            timeout_ms = deadline.as_millis() as u64,
            "Opening feed connection"
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(deadline, this.connector.open()) => match result {
                Ok(result) => result,
                Err(_) => Err(FeedError::ConnectionTimeout {
                    timeout_ms: deadline.as_millis() as u64,
                }),
            },
            _ = abort.cancelled() => {
                debug!(attempt, "Connection attempt aborted");
                return Err(FeedError::ConnectionClosed);
            }
        };

        let mut slot = this.slot.lock();
        let current = matches!(&*slot, Slot::Connecting { attempt: a, .. } if *a == attempt);

        match outcome {
            Ok(link) if !current => {
                drop(slot);
                debug!(attempt, "Connection attempt superseded, releasing link");
                link.shutdown.cancel();
                Err(FeedError::ConnectionClosed)
            }
            Ok(link) => {
                let connection_id = this.connection_ids.fetch_add(1, Ordering::SeqCst) + 1;
                let (events, _) = broadcast::channel(this.config.event_buffer.max(1));
                let connection = Connection {
                    inner: Arc::new(ConnectionInner {
                        id: connection_id,
                        outbound: link.outbound,
                        events,
                        closed: CancellationToken::new(),
                        link_shutdown: link.shutdown,
                    }),
                };
                *slot = Slot::Connected(connection.clone());
                let _ = this.events.send(ConnectionEvent::Connected {
                    connection_id,
                    attempt,
                });
                drop(slot);

                info!(connection_id, attempt, "Feed connection established");
                tokio::spawn(pump_inbound(
                    Arc::downgrade(&this),
                    connection.clone(),
                    link.inbound,
                ));
                Ok(connection)
            }
            Err(error) => {
                if current {
                    *slot = Slot::Failed(error.clone());
                    let _ = this.events.send(ConnectionEvent::Failed {
                        attempt,
                        error: error.clone(),
                    });
                } else {
                    drop(slot);
                }
                warn!(attempt, error = %error, "Feed connection attempt failed");
                Err(error)
            }
        }
    }

    fn connection_lost(&self, connection_id: u64, reason: &str) {
        let mut slot = self.slot.lock();
        let current = matches!(&*slot, Slot::Connected(c) if c.id() == connection_id);
        if !current {
            debug!(connection_id, "Stale connection ended");
            return;
        }
        *slot = Slot::Disconnected;
        let _ = self.events.send(ConnectionEvent::Lost {
            connection_id,
            reason: reason.to_string(),
        });
    }
}

/// Fan inbound envelopes out to listeners until the transport ends
async fn pump_inbound(
    manager: Weak<ManagerInner>,
    connection: Connection,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        tokio::select! {
            biased;
            _ = connection.inner.closed.cancelled() => return,
            envelope = inbound.recv() => match envelope {
                Some(envelope) => {
                    // No listeners is fine, the event is simply not wanted
                    let _ = connection.inner.events.send(envelope);
                }
                None => break,
            },
        }
    }

    connection.close();
    warn!(connection_id = connection.id(), "Feed connection lost");
    if let Some(manager) = manager.upgrade() {
        manager.connection_lost(connection.id(), "transport closed");
    }
}
