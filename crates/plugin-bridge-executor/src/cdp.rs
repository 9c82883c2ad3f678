//! Execution over the remote-debugging transport.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use plugin_bridge_cdp::DebugBrowser;
use plugin_bridge_core::{
    BridgeError, DocumentMutation, ExecutionOutcome, PluginBridge, Screenshot, ScreenshotRequest,
    TransportKind, VariableUpdate, config::TimeoutConfig,
};
use plugin_bridge_session::ConnectionManager;
use serde_json::Value;

use crate::{retry::with_single_retry, scripts};

/// Evaluates directly in the page selected by the connection manager.
pub struct CdpBridge<B: DebugBrowser> {
    manager: Arc<ConnectionManager<B>>,
    command_timeout: Duration,
}

impl<B: DebugBrowser> CdpBridge<B> {
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager<B>>, timeouts: &TimeoutConfig) -> Self {
        Self {
            manager,
            command_timeout: timeouts.command(),
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager<B>> {
        &self.manager
    }

    async fn evaluate(&self, script: &str, timeout: Duration) -> Result<Value, BridgeError> {
        with_single_retry(
            "evaluate",
            || async move {
                let session = self.manager.ensure_connection().await?;
                session.evaluate(script, timeout).await
            },
            || async move { self.manager.force_reconnect().await.map(|_| ()) },
        )
        .await
    }

    async fn run(&self, script: &str, timeout: Duration) -> Result<ExecutionOutcome, BridgeError> {
        let started = Instant::now();
        let value = self.evaluate(script, timeout).await?;
        let outcome = ExecutionOutcome::new(value, TransportKind::RemoteDebugging, started.elapsed());
        if let Some(advisory) = &outcome.advisory {
            tracing::debug!(kind = ?advisory.kind, "Suspiciously empty result");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl<B: DebugBrowser + 'static> PluginBridge for CdpBridge<B> {
    fn transport(&self) -> TransportKind {
        TransportKind::RemoteDebugging
    }

    async fn execute_code(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.run(&scripts::wrap_code(code), timeout).await
    }

    async fn get_variables(&self) -> Result<ExecutionOutcome, BridgeError> {
        self.run(&scripts::get_variables(), self.command_timeout)
            .await
    }

    async fn update_variable(
        &self,
        update: &VariableUpdate,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.run(&scripts::update_variable(update), self.command_timeout)
            .await
    }

    async fn mutate_document(
        &self,
        mutation: &DocumentMutation,
    ) -> Result<ExecutionOutcome, BridgeError> {
        let script = scripts::mutation(mutation)?;
        self.run(&script, self.command_timeout).await
    }

    /// Captures the viewport; `node_id` and `scale` only apply over the relay.
    async fn capture_screenshot(
        &self,
        request: &ScreenshotRequest,
    ) -> Result<Screenshot, BridgeError> {
        let data = with_single_retry(
            "screenshot",
            || async move {
                let session = self.manager.ensure_connection().await?;
                session
                    .screenshot(request.format, self.command_timeout)
                    .await
            },
            || async move { self.manager.force_reconnect().await.map(|_| ()) },
        )
        .await?;
        Screenshot::from_base64(request.format, &data)
    }
}
