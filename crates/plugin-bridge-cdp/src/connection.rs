//! Websocket connection to one debugging target with id-correlated commands.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use plugin_bridge_core::{BridgeError, PendingRequests};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Synthetic event published when the socket closes.
pub const CONNECTION_CLOSED: &str = "Connection.closed";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A protocol event, possibly from a flattened child session.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Incoming {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RemoteError>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    session_id: Option<String>,
}

struct Shared {
    pending: PendingRequests<u64>,
    events: broadcast::Sender<CdpEvent>,
    closed: AtomicBool,
}

impl Shared {
    fn dispatch(&self, raw: &str) {
        let incoming: Incoming = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid debugging protocol frame: {e}");
                return;
            }
        };

        if let Some(id) = incoming.id {
            let reply = match incoming.error {
                Some(err) => {
                    let message = match err.data {
                        Some(data) => format!("{} ({data})", err.message),
                        None => err.message,
                    };
                    Err(BridgeError::from_remote_message(message))
                }
                None => Ok(incoming.result.unwrap_or(Value::Null)),
            };
            if !self.pending.resolve(&id, reply) {
                tracing::debug!(id, "Discarding response with no waiting request");
            }
            return;
        }

        if let Some(method) = incoming.method {
            let _ = self.events.send(CdpEvent {
                method,
                params: incoming.params,
                session_id: incoming.session_id,
            });
        }
    }

    fn mark_closed(&self, err: &BridgeError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let failed = self.pending.fail_all(err);
        if failed > 0 {
            tracing::debug!(failed, "Rejected outstanding debugging commands");
        }
        let _ = self.events.send(CdpEvent {
            method: CONNECTION_CLOSED.to_string(),
            params: json!({ "reason": err.to_string() }),
            session_id: None,
        });
    }
}

/// Connection to a single target's debugging socket.
pub struct CdpConnection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CdpConnection {
    /// Open the socket, giving up after `timeout`.
    ///
    /// # Errors
    /// Returns a connection error if the socket cannot be opened in time.
    pub async fn connect(ws_url: &str, timeout: Duration) -> Result<Arc<Self>, BridgeError> {
        let started = std::time::Instant::now();
        let (socket, _) = tokio::time::timeout(timeout, connect_async(ws_url))
            .await
            .map_err(|_| BridgeError::timeout(format!("connect {ws_url}"), started.elapsed()))?
            .map_err(|e| BridgeError::Connection(format!("cannot open {ws_url}: {e}")))?;

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            pending: PendingRequests::new(),
            events,
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let url = ws_url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => reader_shared.dispatch(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Debugging socket error on {url}: {e}");
                        break;
                    }
                }
            }
            reader_shared.mark_closed(&BridgeError::Connection(format!(
                "debugging connection to {url} closed"
            )));
        });

        tracing::debug!(url = ws_url, "Debugging socket open");

        Ok(Arc::new(Self {
            shared,
            outbound,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    /// Send a command and wait for its response.
    ///
    /// # Errors
    /// Returns the classified remote error, a timeout, or a stale reference
    /// if the connection is already closed.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::StaleReference(format!(
                "{method}: debugging connection is closed"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut frame = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            frame["sessionId"] = Value::String(session_id.to_string());
        }

        let rx = self.shared.pending.register(id)?;
        if self.outbound.send(Message::Text(frame.to_string())).is_err() {
            self.shared.pending.forget(&id);
            return Err(BridgeError::Connection(format!(
                "{method}: debugging connection writer stopped"
            )));
        }

        self.shared.pending.wait(&id, rx, timeout, method).await
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the socket and reject anything still outstanding.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.shared.mark_closed(&BridgeError::StaleReference(
            "debugging connection closed locally".to_string(),
        ));
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        let (events, _) = broadcast::channel(16);
        Shared {
            pending: PendingRequests::new(),
            events,
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn test_response_resolves_matching_id() {
        let shared = shared();
        let rx = shared.pending.register(3).unwrap();
        shared.dispatch(r#"{"id":3,"result":{"result":{"type":"number","value":2}}}"#);
        let value = tokio_test::block_on(rx).unwrap().unwrap();
        assert_eq!(value["result"]["value"], 2);
    }

    #[tokio::test]
    async fn test_error_response_is_classified() {
        let shared = shared();
        let rx = shared.pending.register(4).unwrap();
        shared.dispatch(
            r#"{"id":4,"error":{"code":-32000,"message":"Cannot find context with specified id"}}"#,
        );
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::StaleReference(_)));
    }

    #[tokio::test]
    async fn test_events_carry_session_id() {
        let shared = shared();
        let mut events = shared.events.subscribe();
        shared.dispatch(
            r#"{"method":"Runtime.consoleAPICalled","params":{"type":"log"},"sessionId":"W1"}"#,
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "Runtime.consoleAPICalled");
        assert_eq!(event.session_id.as_deref(), Some("W1"));
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_and_notifies() {
        let shared = shared();
        let mut events = shared.events.subscribe();
        let rx = shared.pending.register(9).unwrap();

        shared.mark_closed(&BridgeError::Connection("gone".into()));
        shared.mark_closed(&BridgeError::Connection("again".into()));

        assert!(matches!(rx.await.unwrap(), Err(BridgeError::Connection(_))));
        assert_eq!(events.recv().await.unwrap().method, CONNECTION_CLOSED);
        assert!(events.try_recv().is_err());
    }
}
