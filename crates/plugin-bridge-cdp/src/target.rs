//! Seam traits over the remote-debugging transport.
//!
//! The session layer only talks to [`DebugBrowser`] and [`DebugPage`], so it
//! can be driven by in-memory implementations in tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use plugin_bridge_core::{BridgeError, ImageFormat, StackTrace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// One inspectable context from the loopback listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    #[must_use]
    pub fn is_page(&self) -> bool {
        self.target_type == "page"
    }

    /// Inspector/devtools tabs are never candidates.
    #[must_use]
    pub fn is_inspector(&self) -> bool {
        self.url.starts_with("devtools://") || self.url.starts_with("chrome-devtools://")
    }
}

/// A worker attached beneath a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    /// Flattened protocol session id used to address the worker.
    pub session_id: String,
    pub target_id: String,
    pub url: String,
}

/// A console API call observed in a page or one of its workers.
#[derive(Debug, Clone)]
pub struct ConsoleEvent {
    /// Console method (`log`, `warning`, `error`, ...).
    pub kind: String,
    pub args: Vec<Value>,
    pub stack_trace: Option<StackTrace>,
    /// Origin of the execution context that logged, when known.
    pub origin: Option<String>,
    /// Set when the call came from a worker.
    pub worker: Option<WorkerInfo>,
    /// Epoch milliseconds reported by the runtime.
    pub timestamp: Option<f64>,
}

/// An uncaught exception.
#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub text: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub stack_trace: Option<StackTrace>,
    pub worker: Option<WorkerInfo>,
    pub timestamp: Option<f64>,
}

/// Runtime events published by an attached page.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Console(ConsoleEvent),
    Exception(ExceptionEvent),
    WorkerCreated(WorkerInfo),
    WorkerDestroyed { session_id: String },
    /// The page connection went away; no further events will follow.
    Detached { reason: String },
}

/// An attached page.
#[async_trait]
pub trait DebugPage: Send + Sync {
    fn target(&self) -> &TargetInfo;

    /// Receiver for runtime events. Subscribe before enabling the runtime.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;

    /// Enable console/exception reporting on the page and its workers.
    async fn enable_runtime(&self) -> Result<(), BridgeError>;

    /// Workers currently attached beneath this page.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Evaluate in the page's main frame, awaiting promises.
    ///
    /// The design application exposes the plugin API global on the main
    /// frame while a plugin is running, so this is the plugin runtime. Worker
    /// contexts only contribute console output and the worker count.
    async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value, BridgeError>;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BridgeError>;

    async fn reload(&self, timeout: Duration) -> Result<(), BridgeError>;

    /// Capture the viewport, returning base64 image data.
    async fn screenshot(&self, format: ImageFormat, timeout: Duration)
    -> Result<String, BridgeError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// The browser-level view of the remote-debugging endpoint.
#[async_trait]
pub trait DebugBrowser: Send + Sync {
    /// Enumerate inspectable contexts.
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, BridgeError>;

    /// Attach to a page target.
    async fn attach(&self, target: &TargetInfo) -> Result<Arc<dyn DebugPage>, BridgeError>;

    /// Open a new blank page.
    async fn open_blank(&self) -> Result<TargetInfo, BridgeError>;

    /// Count workers currently running beneath a page.
    async fn count_workers(&self, target: &TargetInfo) -> Result<usize, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_entry_deserializes() {
        let json = r#"{
            "description": "",
            "devtoolsFrontendUrl": "/devtools/inspector.html?ws=...",
            "id": "ABC",
            "title": "Design file",
            "type": "page",
            "url": "https://app.example/design/123",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/ABC"
        }"#;
        let info: TargetInfo = serde_json::from_str(json).unwrap();
        assert!(info.is_page());
        assert!(!info.is_inspector());
        assert_eq!(
            info.web_socket_debugger_url.as_deref(),
            Some("ws://127.0.0.1:9222/devtools/page/ABC")
        );
    }

    #[test]
    fn test_inspector_urls_detected() {
        let info = TargetInfo {
            id: "x".into(),
            target_type: "page".into(),
            title: String::new(),
            url: "devtools://devtools/bundled/inspector.html".into(),
            web_socket_debugger_url: None,
        };
        assert!(info.is_inspector());
    }
}
