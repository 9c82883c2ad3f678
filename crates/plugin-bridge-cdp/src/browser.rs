//! Loopback HTTP listing endpoint of the remote-debugging transport.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use plugin_bridge_core::{
    BridgeError,
    config::{DebugConfig, TimeoutConfig},
};

use crate::{
    page::CdpPage,
    target::{DebugBrowser, DebugPage, TargetInfo},
};

const LISTING_TIMEOUT: Duration = Duration::from_secs(3);

/// Browser reached through its loopback debugging port.
pub struct CdpBrowser {
    base_url: String,
    client: reqwest::Client,
    connect_timeout: Duration,
    worker_settle: Duration,
}

impl CdpBrowser {
    /// Create a browser handle. No request is made until first use.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(debug: &DebugConfig, timeouts: &TimeoutConfig) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(LISTING_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Connection(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: debug.http_base(),
            client,
            connect_timeout: timeouts.connect(),
            worker_settle: debug.worker_settle(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unreachable(&self, e: &reqwest::Error) -> BridgeError {
        BridgeError::Connection(format!(
            "cannot reach remote-debugging endpoint at {}: {e}. \
             Start the design application with remote debugging enabled.",
            self.base_url
        ))
    }
}

#[async_trait]
impl DebugBrowser for CdpBrowser {
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, BridgeError> {
        let url = format!("{}/json/list", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(&e))?;
        if !response.status().is_success() {
            return Err(BridgeError::Protocol(format!(
                "unexpected status {} from {url}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| BridgeError::Protocol(format!("failed to parse target listing: {e}")))
    }

    async fn attach(&self, target: &TargetInfo) -> Result<Arc<dyn DebugPage>, BridgeError> {
        let page = CdpPage::attach(target, self.connect_timeout).await?;
        Ok(Arc::new(page))
    }

    async fn open_blank(&self) -> Result<TargetInfo, BridgeError> {
        let url = format!("{}/json/new?about:blank", self.base_url);
        let response = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(&e))?;
        if !response.status().is_success() {
            return Err(BridgeError::Protocol(format!(
                "unexpected status {} from {url}",
                response.status()
            )));
        }
        let target: TargetInfo = response
            .json()
            .await
            .map_err(|e| BridgeError::Protocol(format!("failed to parse new target: {e}")))?;
        tracing::info!(target_id = %target.id, "Opened blank page");
        Ok(target)
    }

    async fn count_workers(&self, target: &TargetInfo) -> Result<usize, BridgeError> {
        let page = CdpPage::attach(target, self.connect_timeout).await?;
        tokio::time::sleep(self.worker_settle).await;
        let count = page.workers().len();
        page.close().await;
        tracing::debug!(target_id = %target.id, count, "Probed worker count");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use plugin_bridge_core::ErrorKind;

    use super::*;

    #[test]
    fn test_base_url_from_config() {
        let debug = DebugConfig {
            port: 9333,
            ..DebugConfig::default()
        };
        let browser = CdpBrowser::new(&debug, &TimeoutConfig::default()).unwrap();
        assert_eq!(browser.base_url(), "http://127.0.0.1:9333");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let debug = DebugConfig {
            port: 1,
            ..DebugConfig::default()
        };
        let browser = CdpBrowser::new(&debug, &TimeoutConfig::default()).unwrap();
        let err = browser.list_targets().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_recoverable());
    }
}
