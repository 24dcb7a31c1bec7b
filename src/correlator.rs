//! Request/response correlation over the shared connection
//!
//! A request claims its topic, emits one event and waits for the first of:
//! the matching reply, a server `error` event, the deadline, or the
//! connection dying. At most one request per topic is in flight.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::FeedError;
use crate::transport::{ERROR_EVENT, GET_HISTORICAL_DATA_EVENT, HISTORICAL_DATA_EVENT};
use crate::types::{normalize_symbol, now_ms, Bar, Interval};

/// A request event paired with the one-shot event that answers it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topic {
    pub name: &'static str,
    pub request_event: &'static str,
    pub reply_event: &'static str,
}

impl Topic {
    pub const HISTORY: Topic = Topic {
        name: "historical_data",
        request_event: GET_HISTORICAL_DATA_EVENT,
        reply_event: HISTORICAL_DATA_EVENT,
    };
}

/// Historical snapshot query; times are epoch milliseconds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub symbol: String,
    pub interval: Interval,
    pub start_time: i64,
    pub end_time: i64,
}

impl HistoryRequest {
    /// Window ending now and reaching `lookback` into the past
    pub fn lookback(symbol: &str, interval: Interval, lookback: Duration) -> Self {
        let end_time = now_ms();
        Self {
            symbol: symbol.to_string(),
            interval,
            start_time: end_time - lookback.as_millis() as i64,
            end_time,
        }
    }

    fn validated(mut self) -> Result<Self, FeedError> {
        self.symbol = normalize_symbol(&self.symbol)?;
        if self.start_time >= self.end_time {
            return Err(FeedError::InvalidArgument(format!(
                "startTime {} must be before endTime {}",
                self.start_time, self.end_time
            )));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct Correlator {
    manager: ConnectionManager,
    in_flight: Arc<Mutex<HashSet<&'static str>>>,
    default_timeout: Duration,
}

/// Holds a topic for the lifetime of one request
struct TopicClaim {
    in_flight: Arc<Mutex<HashSet<&'static str>>>,
    name: &'static str,
}

impl Drop for TopicClaim {
    fn drop(&mut self) {
        self.in_flight.lock().remove(self.name);
    }
}

impl Correlator {
    pub fn new(manager: ConnectionManager) -> Self {
        let default_timeout = manager.config().request_timeout;
        Self {
            manager,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_pending(&self, topic: &Topic) -> bool {
        self.in_flight.lock().contains(topic.name)
    }

    fn claim(&self, topic: &Topic) -> Result<TopicClaim, FeedError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(topic.name) {
            return Err(FeedError::RequestInProgress {
                topic: topic.name.to_string(),
            });
        }
        Ok(TopicClaim {
            in_flight: Arc::clone(&self.in_flight),
            name: topic.name,
        })
    }

    /// Send `payload` as `topic.request_event` and wait for its reply payload
    pub async fn request(
        &self,
        topic: Topic,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, FeedError> {
        let claim = self.claim(&topic)?;
        let connection = self.manager.connect().await?;

        // Listen before sending so a fast reply cannot slip past
        let mut replies = connection.listen();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        debug!(
            topic = topic.name,
            connection_id = connection.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Sending correlated request"
        );
        connection.send(topic.request_event, payload)?;

        let outcome = loop {
            tokio::select! {
                received = replies.recv() => match received {
                    Ok(envelope) if envelope.event == topic.reply_event => {
                        break reply_payload(&topic, envelope.data);
                    }
                    Ok(envelope) if envelope.event == ERROR_EVENT => {
                        break Err(FeedError::ServerError(error_message(&envelope.data)));
                    }
                    Ok(_) => continue,
                    // The reply may be among the skipped events
                    Err(RecvError::Lagged(skipped)) => {
                        break Err(FeedError::Transport(format!(
                            "reply listener lagged by {skipped} events"
                        )));
                    }
                    Err(RecvError::Closed) => {
                        break Err(FeedError::ConnectionLost(
                            "connection closed while awaiting reply".to_string(),
                        ));
                    }
                },
                _ = &mut deadline => {
                    break Err(FeedError::RequestTimeout {
                        topic: topic.name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                _ = connection.closed() => {
                    break Err(FeedError::ConnectionLost(
                        "connection lost while awaiting reply".to_string(),
                    ));
                }
            }
        };

        // Retire the listener and the claim before anyone sees the outcome
        drop(replies);
        drop(claim);

        match &outcome {
            Ok(_) => debug!(topic = topic.name, "Correlated request settled"),
            Err(e) => warn!(topic = topic.name, error = %e, "Correlated request failed"),
        }
        outcome
    }

    /// Fetch an ordered bar snapshot. An empty snapshot is `NoData`.
    pub async fn fetch_history(&self, request: HistoryRequest) -> Result<Vec<Bar>, FeedError> {
        let request = request.validated()?;
        let payload = serde_json::to_value(&request)?;
        let reply = self
            .request(Topic::HISTORY, payload, self.default_timeout)
            .await?;
        let bars: Vec<Bar> = serde_json::from_value(reply)?;
        if bars.is_empty() {
            return Err(FeedError::NoData {
                topic: Topic::HISTORY.name.to_string(),
            });
        }
        info!(
            symbol = %request.symbol,
            interval = %request.interval,
            count = bars.len(),
            "Historical data received"
        );
        Ok(bars)
    }
}

fn reply_payload(topic: &Topic, data: Value) -> Result<Value, FeedError> {
    let empty = match &data {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        return Err(FeedError::NoData {
            topic: topic.name.to_string(),
        });
    }
    Ok(data)
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        Value::Null => "unknown server error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TransportConfig;
    use crate::transport::MemoryConnector;
    use serde_json::json;

    const ECHO: Topic = Topic {
        name: "echo",
        request_event: "echo_request",
        reply_event: "echo_reply",
    };

    fn correlator() -> (Correlator, tokio::sync::mpsc::UnboundedReceiver<crate::transport::MemoryPeer>) {
        let (connector, peers) = MemoryConnector::new();
        let manager = ConnectionManager::new(Arc::new(connector), TransportConfig::default());
        (Correlator::new(manager), peers)
    }

    #[tokio::test]
    async fn reply_resolves_request() {
        let (correlator, mut peers) = correlator();
        let server = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            let request = peer.expect("echo_request").await.unwrap();
            peer.send("unrelated", json!({ "noise": true }));
            peer.send("echo_reply", request.data);
            peer
        });

        let reply = correlator
            .request(ECHO, json!({ "n": 7 }), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply["n"], 7);
        assert_eq!(correlator.pending_count(), 0);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn empty_reply_is_no_data() {
        let (correlator, mut peers) = correlator();
        tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            peer.expect("echo_request").await.unwrap();
            peer.send("echo_reply", json!([]));
            peer.expect("never").await;
        });

        let err = correlator
            .request(ECHO, Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FeedError::NoData {
                topic: "echo".to_string()
            }
        );
    }

    #[tokio::test]
    async fn error_event_rejects_request() {
        let (correlator, mut peers) = correlator();
        tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            peer.expect("echo_request").await.unwrap();
            peer.send(ERROR_EVENT, json!({ "message": "symbol not found" }));
            peer.expect("never").await;
        });

        let err = correlator
            .request(ECHO, Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, FeedError::ServerError("symbol not found".to_string()));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn connection_loss_rejects_request() {
        let (correlator, mut peers) = correlator();
        tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            peer.expect("echo_request").await.unwrap();
            peer.sever();
        });

        let err = correlator
            .request(ECHO, Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::ConnectionLost(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lagged_listener_fails_fast() {
        let (connector, mut peers) = MemoryConnector::new();
        let config = TransportConfig {
            event_buffer: 1,
            ..TransportConfig::default()
        };
        let manager = ConnectionManager::new(Arc::new(connector), config);
        let correlator = Correlator::new(manager);

        let pending = tokio::spawn({
            let correlator = correlator.clone();
            async move {
                correlator
                    .request(ECHO, Value::Null, Duration::from_secs(30))
                    .await
            }
        });
        let mut peer = peers.recv().await.unwrap();
        peer.expect("echo_request").await.unwrap();

        // The reply is pushed out of the one-slot buffer before the listener reads
        peer.send("echo_reply", json!({ "n": 1 }));
        for n in 0..3 {
            peer.send("noise", json!({ "n": n }));
        }

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, FeedError::Transport(_)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn history_request_rejects_inverted_window() {
        let (correlator, _peers) = correlator();
        let request = HistoryRequest {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Hour1,
            start_time: 10,
            end_time: 5,
        };
        assert!(matches!(
            correlator.fetch_history(request).await,
            Err(FeedError::InvalidArgument(_))
        ));
    }

    #[test]
    fn history_request_wire_shape() {
        let request = HistoryRequest {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Hour4,
            start_time: 1,
            end_time: 2,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "symbol": "BTCUSDT", "interval": "4h", "startTime": 1, "endTime": 2 })
        );
    }

    #[test]
    fn lookback_window_spans_requested_duration() {
        let request = HistoryRequest::lookback("ETHUSDT", Interval::Hour1, Duration::from_secs(3_600));
        assert_eq!(request.end_time - request.start_time, 3_600_000);
    }
}
