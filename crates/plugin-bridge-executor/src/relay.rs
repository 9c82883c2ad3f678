//! Execution over the message relay.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use plugin_bridge_core::{
    BridgeConfig, BridgeError, DocumentMutation, ExecutionOutcome, ImageFormat, PluginBridge,
    Screenshot, ScreenshotRequest, TransportKind, VariableUpdate, error::is_stale_reference_message,
};
use plugin_bridge_relay::{
    CommandChannel,
    protocol::{CAPTURE_SCREENSHOT, EXECUTE_CODE, GET_VARIABLES_DATA, UPDATE_VARIABLE},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::retry::with_single_retry;

/// Extra time allowed for the round-trip on top of the plugin-side timeout.
const RESPONSE_MARGIN: Duration = Duration::from_secs(1);

/// Sends every capability as a command to the connected plugin.
pub struct RelayBridge {
    channel: Arc<CommandChannel>,
    command_timeout: Duration,
    reconnect_grace: Duration,
}

impl RelayBridge {
    #[must_use]
    pub fn new(channel: Arc<CommandChannel>, config: &BridgeConfig) -> Self {
        Self {
            channel,
            command_timeout: config.timeouts.command(),
            reconnect_grace: config.relay.reconnect_grace(),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Send a command; on connection loss wait for the plugin to reattach and
    /// send it once more.
    async fn command(
        &self,
        command_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let payload = &payload;
        with_single_retry(
            command_type,
            || async move {
                self.channel
                    .send_command(command_type, payload.clone(), timeout)
                    .await
            },
            || async move { self.channel.wait_for_client(self.reconnect_grace).await },
        )
        .await
    }

    async fn run(
        &self,
        command_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BridgeError> {
        let started = Instant::now();
        let value = self.command(command_type, payload, timeout).await?;
        Ok(ExecutionOutcome::new(
            value,
            TransportKind::MessageRelay,
            started.elapsed(),
        ))
    }
}

/// Envelope the plugin wraps code results in.
#[derive(Debug, Deserialize)]
struct ExecuteEnvelope {
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    stack: Option<String>,
}

fn unwrap_execute_result(value: Value) -> Result<Value, BridgeError> {
    let is_envelope = value.get("success").is_some_and(Value::is_boolean);
    if !is_envelope {
        return Ok(value);
    }
    let envelope: ExecuteEnvelope = serde_json::from_value(value)
        .map_err(|e| BridgeError::Protocol(format!("malformed execution result: {e}")))?;
    if envelope.success {
        return Ok(envelope.result);
    }
    let message = envelope
        .error
        .unwrap_or_else(|| "plugin reported failure without a message".to_string());
    if is_stale_reference_message(&message) {
        Err(BridgeError::StaleReference(message))
    } else {
        Err(BridgeError::Execution {
            message,
            stack: envelope.stack,
        })
    }
}

/// Image returned by `CAPTURE_SCREENSHOT`.
#[derive(Debug, Deserialize)]
struct RelayImage {
    #[serde(alias = "data")]
    base64: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

const fn export_format(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "PNG",
        ImageFormat::Jpeg => "JPG",
    }
}

#[async_trait]
impl PluginBridge for RelayBridge {
    fn transport(&self) -> TransportKind {
        TransportKind::MessageRelay
    }

    async fn execute_code(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BridgeError> {
        let started = Instant::now();
        let payload = json!({
            "code": code,
            "timeout": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        });
        let raw = self
            .command(EXECUTE_CODE, payload, timeout + RESPONSE_MARGIN)
            .await?;
        let value = unwrap_execute_result(raw)?;
        Ok(ExecutionOutcome::new(
            value,
            TransportKind::MessageRelay,
            started.elapsed(),
        ))
    }

    async fn get_variables(&self) -> Result<ExecutionOutcome, BridgeError> {
        self.run(GET_VARIABLES_DATA, json!({}), self.command_timeout)
            .await
    }

    async fn update_variable(
        &self,
        update: &VariableUpdate,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.run(UPDATE_VARIABLE, update.payload(), self.command_timeout)
            .await
    }

    async fn mutate_document(
        &self,
        mutation: &DocumentMutation,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.run(
            mutation.command_type(),
            mutation.payload(),
            self.command_timeout,
        )
        .await
    }

    async fn capture_screenshot(
        &self,
        request: &ScreenshotRequest,
    ) -> Result<Screenshot, BridgeError> {
        let payload = json!({
            "nodeId": request.node_id,
            "format": export_format(request.format),
            "scale": request.scale,
        });
        let raw = self
            .command(CAPTURE_SCREENSHOT, payload, self.command_timeout)
            .await?;
        let image = raw.get("image").cloned().unwrap_or(raw);
        let image: RelayImage = serde_json::from_value(image)
            .map_err(|e| BridgeError::Protocol(format!("malformed screenshot result: {e}")))?;
        Ok(Screenshot::from_base64(request.format, &image.base64)?
            .with_size(image.width, image.height))
    }
}

#[cfg(test)]
mod tests {
    use plugin_bridge_core::EmptinessKind;
    use plugin_bridge_relay::RelayRequest;
    use tokio::sync::mpsc;

    use super::*;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.relay.reconnect_grace_ms = 500;
        config
    }

    /// Attach a fake plugin that answers every request with `respond`.
    fn fake_plugin<F>(channel: &Arc<CommandChannel>, respond: F) -> mpsc::UnboundedReceiver<RelayRequest>
    where
        F: Fn(&RelayRequest) -> Value + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        let channel = Arc::clone(channel);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let request: RelayRequest = serde_json::from_str(&text).unwrap();
                let reply = json!({"id": request.id, "result": respond(&request)});
                let _ = seen_tx.send(request);
                channel.handle_frame(&reply.to_string());
            }
        });
        seen_rx
    }

    #[tokio::test]
    async fn test_execute_unwraps_envelope() {
        let channel = Arc::new(CommandChannel::new());
        let mut seen = fake_plugin(&channel, |_| json!({"success": true, "result": {"name": "Page 1"}}));
        let bridge = RelayBridge::new(Arc::clone(&channel), &config());

        let outcome = bridge
            .execute_code("return figma.currentPage.name", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.value, json!({"name": "Page 1"}));
        assert_eq!(outcome.transport, TransportKind::MessageRelay);

        let request = seen.recv().await.unwrap();
        assert_eq!(request.command_type, EXECUTE_CODE);
        assert_eq!(request.payload["timeout"], 5000);
    }

    #[tokio::test]
    async fn test_execute_failure_envelope_is_execution_error() {
        let channel = Arc::new(CommandChannel::new());
        let _seen = fake_plugin(&channel, |_| {
            json!({"success": false, "error": "ReferenceError: x is not defined"})
        });
        let bridge = RelayBridge::new(Arc::clone(&channel), &config());

        let err = bridge
            .execute_code("return x", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Execution { .. }));
        assert!(!err.remediation().hint.is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_plugin_then_retries_once() {
        let channel = Arc::new(CommandChannel::new());
        let bridge = RelayBridge::new(Arc::clone(&channel), &config());

        let late = Arc::clone(&channel);
        let attach = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            fake_plugin(&late, |_| json!({"collections": [], "variables": []}))
        });

        let outcome = bridge.get_variables().await.unwrap();
        assert_eq!(outcome.advisory.map(|a| a.kind), Some(EmptinessKind::AllFieldsEmpty));
        drop(attach.await.unwrap());
    }

    #[tokio::test]
    async fn test_no_plugin_surfaces_connection_error() {
        let channel = Arc::new(CommandChannel::new());
        let mut config = config();
        config.relay.reconnect_grace_ms = 10;
        let bridge = RelayBridge::new(channel, &config);

        let err = bridge.get_variables().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
    }

    #[tokio::test]
    async fn test_mutation_and_variable_commands() {
        let channel = Arc::new(CommandChannel::new());
        let mut seen = fake_plugin(&channel, |_| json!({"ok": true}));
        let bridge = RelayBridge::new(Arc::clone(&channel), &config());

        bridge
            .mutate_document(&DocumentMutation::MoveNode {
                node_id: "1:2".into(),
                x: 10.0,
                y: 20.0,
            })
            .await
            .unwrap();
        let request = seen.recv().await.unwrap();
        assert_eq!(request.command_type, "MOVE_NODE");
        assert_eq!(request.payload["nodeId"], "1:2");

        bridge
            .update_variable(&VariableUpdate {
                variable_id: "VariableID:1".into(),
                mode_id: "1:0".into(),
                value: json!(4),
            })
            .await
            .unwrap();
        let request = seen.recv().await.unwrap();
        assert_eq!(request.command_type, UPDATE_VARIABLE);
        assert_eq!(request.payload["value"], 4);
    }

    #[tokio::test]
    async fn test_screenshot_result_decoded() {
        let channel = Arc::new(CommandChannel::new());
        let mut seen = fake_plugin(&channel, |_| {
            json!({"image": {"base64": "aGVsbG8=", "width": 10, "height": 20}})
        });
        let bridge = RelayBridge::new(Arc::clone(&channel), &config());

        let shot = bridge
            .capture_screenshot(&ScreenshotRequest {
                node_id: Some("1:2".into()),
                format: ImageFormat::Jpeg,
                scale: 2.0,
            })
            .await
            .unwrap();
        assert_eq!(shot.bytes, b"hello");
        assert_eq!((shot.width, shot.height), (Some(10), Some(20)));

        let request = seen.recv().await.unwrap();
        assert_eq!(request.payload["format"], "JPG");
        assert_eq!(request.payload["scale"], 2.0);
    }
}
