//! Request/response correlation over the relay socket.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use plugin_bridge_core::{
    BridgeError, LogBuffer, LogEntry, LogLevel, LogSource, PendingRequests, TruncationLimits,
    log_entry::format_message,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::protocol::{
    CONSOLE_CAPTURE, ConsoleCapture, FILE_INFO, InboundFrame, RelayEvent, RelayRequest,
    salvage_id,
};

/// The document the connected plugin reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_key: Option<String>,
}

struct Outbound {
    token: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct ConsoleSink {
    buffer: Arc<LogBuffer>,
    limits: TruncationLimits,
}

/// Command channel to the plugin.
///
/// At most one plugin connection is attached at a time. Replies are matched
/// purely by id, so any number of commands may be outstanding and may be
/// answered in any order.
pub struct CommandChannel {
    outbound: Mutex<Option<Outbound>>,
    pending: PendingRequests<String>,
    connected: watch::Sender<bool>,
    next_token: AtomicU64,
    console: Option<ConsoleSink>,
    file_info: Mutex<Option<FileInfo>>,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandChannel {
    #[must_use]
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            outbound: Mutex::new(None),
            pending: PendingRequests::new(),
            connected,
            next_token: AtomicU64::new(1),
            console: None,
            file_info: Mutex::new(None),
        }
    }

    /// Forward console output captured by the plugin into `buffer`.
    #[must_use]
    pub fn with_console_capture(mut self, buffer: Arc<LogBuffer>, limits: TruncationLimits) -> Self {
        self.console = Some(ConsoleSink { buffer, limits });
        self
    }

    /// Attach a plugin connection. Returns a token for [`Self::detach`].
    ///
    /// A previously attached connection is replaced and its outstanding
    /// commands are rejected.
    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Outbound { token, tx });
        if previous.is_some() {
            let failed = self.pending.fail_all(&BridgeError::Connection(
                "relay connection replaced by a new plugin connection".to_string(),
            ));
            tracing::warn!(failed, "Plugin connection replaced");
        }
        self.connected.send_replace(true);
        tracing::info!(token, "Plugin connected to relay");
        token
    }

    /// Detach the connection identified by `token`.
    ///
    /// Every outstanding command is rejected immediately. A stale token (the
    /// connection was already replaced) is ignored.
    pub fn detach(&self, token: u64) -> bool {
        {
            let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            if outbound.as_ref().is_none_or(|o| o.token != token) {
                return false;
            }
            *outbound = None;
        }
        self.connected.send_replace(false);
        let failed = self
            .pending
            .fail_all(&BridgeError::Connection("relay connection lost".to_string()));
        tracing::info!(token, failed, "Plugin disconnected from relay");
        true
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until a plugin connection is attached.
    ///
    /// # Errors
    /// Returns a connection error if none arrives within `timeout`.
    pub async fn wait_for_client(&self, timeout: Duration) -> Result<(), BridgeError> {
        let mut rx = self.connected.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|connected| *connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(BridgeError::Connection(format!(
                "no plugin connected to the relay within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Number of commands awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The document last reported by the plugin.
    #[must_use]
    pub fn file_info(&self) -> Option<FileInfo> {
        self.file_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send a command and wait for its reply.
    ///
    /// # Errors
    /// Returns a connection error if no plugin is attached or it disconnects
    /// while waiting, a timeout if no reply arrives in time, or the error the
    /// plugin reported.
    pub async fn send_command(
        &self,
        command_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let id = Uuid::new_v4().to_string();
        let request = RelayRequest {
            id: id.clone(),
            command_type: command_type.to_string(),
            payload,
        };
        let text = serde_json::to_string(&request)
            .map_err(|e| BridgeError::Protocol(format!("failed to encode {command_type}: {e}")))?;

        let rx = self.pending.register(id.clone())?;
        if let Err(e) = self.transmit(text) {
            self.pending.forget(&id);
            return Err(e);
        }
        tracing::debug!(%id, command_type, "Relay command sent");

        self.pending.wait(&id, rx, timeout, command_type).await
    }

    fn transmit(&self, text: String) -> Result<(), BridgeError> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(outbound) = outbound.as_ref() else {
            return Err(BridgeError::Connection(
                "no plugin connected to the relay".to_string(),
            ));
        };
        outbound
            .tx
            .send(text)
            .map_err(|_| BridgeError::Connection("relay connection closed".to_string()))
    }

    /// Handle one inbound text frame from the plugin.
    ///
    /// A malformed frame that still names an outstanding command fails that
    /// command with a protocol error instead of leaving it to time out.
    pub fn handle_frame(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Response(response)) => {
                let id = response.id.clone();
                if !self.pending.resolve(&id, response.into_reply()) {
                    tracing::debug!(%id, "Discarding reply for unknown or expired command");
                }
            }
            Ok(InboundFrame::Event(event)) => self.handle_event(event),
            Err(e) => match salvage_id(text) {
                Some(id) if self.pending.resolve(&id, Err(e.clone())) => {
                    tracing::warn!(%id, "Failed command on malformed reply: {e}");
                }
                _ => tracing::warn!("{e}"),
            },
        }
    }

    fn handle_event(&self, event: RelayEvent) {
        match event.event_type.as_str() {
            CONSOLE_CAPTURE => {
                let Some(sink) = &self.console else {
                    return;
                };
                match serde_json::from_value::<ConsoleCapture>(event.payload) {
                    Ok(capture) => sink.buffer.push(capture_entry(capture, &sink.limits)),
                    Err(e) => tracing::warn!("Malformed console capture: {e}"),
                }
            }
            FILE_INFO => match serde_json::from_value::<FileInfo>(event.payload) {
                Ok(info) => {
                    tracing::info!(file = %info.file_name, "Plugin reported open file");
                    *self.file_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
                }
                Err(e) => tracing::warn!("Malformed file info: {e}"),
            },
            other => tracing::debug!(event = other, "Ignoring relay event"),
        }
    }
}

fn capture_entry(capture: ConsoleCapture, limits: &TruncationLimits) -> LogEntry {
    let args: Vec<Value> = capture.args.iter().map(|a| limits.apply(a)).collect();
    let message = capture
        .message
        .unwrap_or_else(|| format_message(&args));
    let mut entry = LogEntry::new(
        LogLevel::from_console_type(&capture.level),
        limits.apply_str(&message),
        LogSource::Plugin,
    )
    .with_args(args);
    if let Some(ts) = capture.timestamp {
        entry = entry.with_timestamp(ts);
    }
    entry
}
