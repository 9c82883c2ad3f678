//! Transport selection behind the capability interface.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use plugin_bridge_core::{
    BridgeError, DocumentMutation, ExecutionOutcome, PluginBridge, Screenshot, ScreenshotRequest,
    TransportKind, VariableUpdate,
};

use crate::relay::RelayBridge;

/// Routes to the relay while a plugin is connected to it, otherwise to the
/// remote-debugging bridge.
pub struct AutoBridge {
    relay: RelayBridge,
    fallback: Arc<dyn PluginBridge>,
}

impl AutoBridge {
    #[must_use]
    pub fn new(relay: RelayBridge, fallback: Arc<dyn PluginBridge>) -> Self {
        Self { relay, fallback }
    }

    fn select(&self) -> &dyn PluginBridge {
        if self.relay.channel().is_connected() {
            &self.relay
        } else {
            self.fallback.as_ref()
        }
    }
}

#[async_trait]
impl PluginBridge for AutoBridge {
    fn transport(&self) -> TransportKind {
        self.select().transport()
    }

    async fn execute_code(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.select().execute_code(code, timeout).await
    }

    async fn get_variables(&self) -> Result<ExecutionOutcome, BridgeError> {
        self.select().get_variables().await
    }

    async fn update_variable(
        &self,
        update: &VariableUpdate,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.select().update_variable(update).await
    }

    async fn mutate_document(
        &self,
        mutation: &DocumentMutation,
    ) -> Result<ExecutionOutcome, BridgeError> {
        self.select().mutate_document(mutation).await
    }

    async fn capture_screenshot(
        &self,
        request: &ScreenshotRequest,
    ) -> Result<Screenshot, BridgeError> {
        self.select().capture_screenshot(request).await
    }
}

#[cfg(test)]
mod tests {
    use plugin_bridge_core::{BridgeConfig, LogBuffer};
    use plugin_bridge_relay::CommandChannel;
    use plugin_bridge_session::{ConnectionManager, testing::MockBrowser};
    use tokio::sync::mpsc;

    use super::*;
    use crate::cdp::CdpBridge;

    #[tokio::test]
    async fn test_prefers_connected_relay() {
        let config = BridgeConfig::default();
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = Arc::new(ConnectionManager::new(
            browser,
            Arc::new(LogBuffer::new(10)),
            &config,
        ));
        let channel = Arc::new(CommandChannel::new());
        let bridge = AutoBridge::new(
            RelayBridge::new(Arc::clone(&channel), &config),
            Arc::new(CdpBridge::new(manager, &config.timeouts)),
        );

        assert_eq!(bridge.transport(), TransportKind::RemoteDebugging);
        let outcome = bridge
            .execute_code("return 1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.transport, TransportKind::RemoteDebugging);

        let (tx, _rx) = mpsc::unbounded_channel();
        let token = channel.attach(tx);
        assert_eq!(bridge.transport(), TransportKind::MessageRelay);
        channel.detach(token);
        assert_eq!(bridge.transport(), TransportKind::RemoteDebugging);
    }
}
