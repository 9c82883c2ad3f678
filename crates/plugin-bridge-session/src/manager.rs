//! Connection/session manager for the remote-debugging transport.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use plugin_bridge_cdp::{DebugBrowser, DebugPage, TargetInfo, WorkerInfo};
use plugin_bridge_core::{
    BridgeConfig, BridgeError, ImageFormat, LogBuffer, SessionId,
    config::{DebugConfig, TimeoutConfig},
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    discovery::{self, Selection},
    monitor::ConsoleMonitor,
};

/// Cheap round-trip used to prove the page is still alive.
pub const HEALTH_CHECK_EXPRESSION: &str = "1 + 1";

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { monitoring: bool },
}

/// Snapshot returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub session_id: Option<SessionId>,
    pub target_id: Option<String>,
    pub target_url: Option<String>,
    pub worker_count: usize,
    pub monitoring: bool,
    pub last_health_check_ms_ago: Option<u64>,
}

struct Session {
    id: SessionId,
    page: Arc<dyn DebugPage>,
    revoked: Arc<AtomicBool>,
    worker_count: usize,
    monitoring_active: bool,
    last_health_check: Instant,
}

impl Session {
    fn new(page: Arc<dyn DebugPage>, worker_count: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            page,
            revoked: Arc::new(AtomicBool::new(false)),
            worker_count,
            monitoring_active: false,
            last_health_check: Instant::now(),
        }
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            page: Arc::clone(&self.page),
            revoked: Arc::clone(&self.revoked),
        }
    }
}

/// A revocable reference to the page of one session.
///
/// Once the manager tears the session down every call fails with
/// [`BridgeError::StaleReference`]; a handle is never rerouted silently.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    page: Arc<dyn DebugPage>,
    revoked: Arc<AtomicBool>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("target", &self.page.target().id)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn target(&self) -> &TargetInfo {
        self.page.target()
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// The underlying page, if the session is still live.
    ///
    /// # Errors
    /// Returns [`BridgeError::StaleReference`] after teardown.
    pub fn page(&self) -> Result<&Arc<dyn DebugPage>, BridgeError> {
        if self.is_revoked() || self.page.is_closed() {
            return Err(BridgeError::StaleReference(format!(
                "session {} was torn down",
                self.id
            )));
        }
        Ok(&self.page)
    }

    /// Evaluate in the session's page.
    ///
    /// # Errors
    /// Returns error if the session is stale or evaluation fails.
    pub async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value, BridgeError> {
        self.page()?.evaluate(expression, timeout).await
    }

    /// Workers beneath the session's page.
    ///
    /// # Errors
    /// Returns error if the session is stale.
    pub fn workers(&self) -> Result<Vec<WorkerInfo>, BridgeError> {
        Ok(self.page()?.workers())
    }

    /// Capture the session's viewport as base64 image data.
    ///
    /// # Errors
    /// Returns error if the session is stale or capture fails.
    pub async fn screenshot(
        &self,
        format: ImageFormat,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        self.page()?.screenshot(format, timeout).await
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    /// Whether the caller asked for console capture. Survives reconnects.
    monitor_wanted: bool,
}

/// Owns the single remote-debugging session and the console monitor.
pub struct ConnectionManager<B: DebugBrowser> {
    browser: Arc<B>,
    monitor: ConsoleMonitor,
    debug: DebugConfig,
    timeouts: TimeoutConfig,
    inner: Mutex<Inner>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl<B: DebugBrowser> ConnectionManager<B> {
    #[must_use]
    pub fn new(browser: Arc<B>, buffer: Arc<LogBuffer>, config: &BridgeConfig) -> Self {
        let state = Arc::new(watch::channel(ConnectionState::Disconnected).0);
        let published = Arc::clone(&state);
        let monitor = ConsoleMonitor::new(buffer, &config.console).with_exit_hook(Arc::new(
            move |target_id: &str| {
                published.send_if_modified(|state| {
                    if *state != (ConnectionState::Connected { monitoring: true }) {
                        return false;
                    }
                    *state = ConnectionState::Connected { monitoring: false };
                    tracing::info!(%target_id, "Console monitoring ended with the page");
                    true
                });
            },
        ));
        Self {
            browser,
            monitor,
            debug: config.debug.clone(),
            timeouts: config.timeouts.clone(),
            inner: Mutex::new(Inner::default()),
            state,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<LogBuffer> {
        self.monitor.buffer()
    }

    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "Connection state changed");
        }
    }

    /// Return a live session, reconnecting if the health check fails.
    ///
    /// # Errors
    /// Returns error if no page can be attached within the connect timeout.
    pub async fn ensure_connection(&self) -> Result<SessionHandle, BridgeError> {
        let mut inner = self.inner.lock().await;
        self.ensure_locked(&mut inner).await
    }

    /// Tear down the current session unconditionally and build a new one.
    ///
    /// # Errors
    /// Returns error if no page can be attached within the connect timeout.
    pub async fn force_reconnect(&self) -> Result<SessionHandle, BridgeError> {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner, "forced reconnect").await;
        self.connect(&mut inner).await
    }

    /// Start console capture on the current page, connecting if needed.
    ///
    /// Always restarts the monitor; a monitor that reports itself active may
    /// be attached to a context that is already gone.
    ///
    /// # Errors
    /// Returns error if connecting or subscribing fails.
    pub async fn start_monitoring(&self) -> Result<SessionHandle, BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.monitor_wanted = true;
        let handle = self.ensure_locked(&mut inner).await?;
        self.restart_monitor(&mut inner).await?;
        Ok(handle)
    }

    /// Stop console capture. Buffered entries are kept.
    pub async fn stop_monitoring(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.monitor_wanted = false;
        let stopped = self.monitor.stop_monitoring();
        if let Some(session) = inner.session.as_mut() {
            session.monitoring_active = false;
            self.set_state(ConnectionState::Connected { monitoring: false });
        }
        stopped
    }

    /// Navigate the current page and wait for it to load.
    ///
    /// # Errors
    /// Returns error on connection failure or if the load does not complete
    /// within the navigate timeout.
    pub async fn navigate(&self, url: &str) -> Result<SessionHandle, BridgeError> {
        let mut inner = self.inner.lock().await;
        let handle = self.ensure_locked(&mut inner).await?;
        let timeout = self.timeouts.navigate();
        bounded("navigate", timeout, handle.page()?.navigate(url, timeout)).await?;
        tracing::info!(%url, "Navigated");
        self.after_page_change(&mut inner).await;
        Ok(handle)
    }

    /// Reload the current page and wait for it to load.
    ///
    /// # Errors
    /// Returns error on connection failure or if the load does not complete
    /// within the reload timeout.
    pub async fn reload(&self) -> Result<SessionHandle, BridgeError> {
        let mut inner = self.inner.lock().await;
        let handle = self.ensure_locked(&mut inner).await?;
        let timeout = self.timeouts.reload();
        bounded("reload", timeout, handle.page()?.reload(timeout)).await?;
        tracing::info!("Reloaded");
        self.after_page_change(&mut inner).await;
        Ok(handle)
    }

    /// Run one discovery pass and move to a better page if warranted.
    ///
    /// Returns whether the session switched pages. Buffered history is kept.
    ///
    /// # Errors
    /// Returns error if listing or attaching fails.
    pub async fn reevaluate(&self) -> Result<bool, BridgeError> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.session.as_ref().map(|s| Arc::clone(&s.page)) else {
            return Ok(false);
        };
        let current_id = current.target().id.clone();

        let candidates =
            discovery::discover(self.browser.as_ref(), Some(current.as_ref())).await?;
        if let (Some(session), Some(current)) = (
            inner.session.as_mut(),
            candidates.iter().find(|c| c.is_current),
        ) {
            session.worker_count = current.worker_count;
        }

        let Some(index) = discovery::should_switch(
            &candidates,
            self.debug.hysteresis_margin,
            &self.debug.document_markers,
        ) else {
            return Ok(false);
        };
        let next = &candidates[index];
        tracing::info!(
            from = %current_id,
            to = %next.target.id,
            url = %next.url(),
            workers = next.worker_count,
            "Switching monitored page"
        );

        let page = self.browser.attach(&next.target).await?;
        self.teardown(&mut inner, "page switch").await;
        inner.session = Some(Session::new(page, next.worker_count));
        self.set_state(ConnectionState::Connected { monitoring: false });
        if inner.monitor_wanted {
            self.restart_monitor(&mut inner).await?;
        }
        Ok(true)
    }

    /// Re-run discovery on a fixed interval until the handle is aborted.
    pub fn spawn_reevaluation(self: Arc<Self>, interval: Duration) -> JoinHandle<()>
    where
        B: 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.reevaluate().await {
                    tracing::warn!("Page re-evaluation failed: {e}");
                }
            }
        })
    }

    /// Current session without a health check.
    pub async fn current(&self) -> Option<SessionHandle> {
        self.inner.lock().await.session.as_ref().map(Session::handle)
    }

    pub async fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref();
        ConnectionStatus {
            state: self.state(),
            session_id: session.map(|s| s.id),
            target_id: session.map(|s| s.page.target().id.clone()),
            target_url: session.map(|s| s.page.target().url.clone()),
            worker_count: session.map_or(0, |s| s.page.workers().len().max(s.worker_count)),
            monitoring: session.is_some_and(|s| s.monitoring_active) && self.monitor.is_active(),
            last_health_check_ms_ago: session.map(|s| {
                u64::try_from(s.last_health_check.elapsed().as_millis()).unwrap_or(u64::MAX)
            }),
        }
    }

    /// Tear down the session and stop monitoring.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.monitor_wanted = false;
        self.teardown(&mut inner, "closed").await;
    }

    async fn ensure_locked(&self, inner: &mut Inner) -> Result<SessionHandle, BridgeError> {
        if let Some(session) = inner.session.as_mut() {
            match self.health_check(session.page.as_ref()).await {
                Ok(()) => {
                    session.last_health_check = Instant::now();
                    return Ok(session.handle());
                }
                Err(e) => tracing::warn!(session_id = %session.id, "Health check failed: {e}"),
            }
            self.teardown(inner, "health check failed").await;
        }
        self.connect(inner).await
    }

    async fn health_check(&self, page: &dyn DebugPage) -> Result<(), BridgeError> {
        if page.is_closed() {
            return Err(BridgeError::StaleReference("page connection closed".to_string()));
        }
        let timeout = self.timeouts.health_check();
        bounded(
            "health check",
            timeout,
            page.evaluate(HEALTH_CHECK_EXPRESSION, timeout),
        )
        .await
        .map(|_| ())
    }

    async fn connect(&self, inner: &mut Inner) -> Result<SessionHandle, BridgeError> {
        self.set_state(ConnectionState::Connecting);
        let opened = bounded("connect", self.timeouts.connect(), self.open_session()).await;
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Connect failed: {e}");
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        tracing::info!(
            session_id = %session.id,
            target_id = %session.page.target().id,
            url = %session.page.target().url,
            workers = session.worker_count,
            "Connected"
        );
        let handle = session.handle();
        inner.session = Some(session);
        self.set_state(ConnectionState::Connected { monitoring: false });

        if inner.monitor_wanted {
            if let Err(e) = self.restart_monitor(inner).await {
                tracing::warn!("Console monitor restart after reconnect failed: {e}");
            }
        }
        Ok(handle)
    }

    async fn open_session(&self) -> Result<Session, BridgeError> {
        let candidates = discovery::discover(self.browser.as_ref(), None).await?;
        let (target, worker_count) =
            match discovery::select_initial(&candidates, &self.debug.document_markers) {
                Selection::Existing(i) => {
                    (candidates[i].target.clone(), candidates[i].worker_count)
                }
                Selection::CreateBlank => (self.browser.open_blank().await?, 0),
            };
        let page = self.browser.attach(&target).await?;
        Ok(Session::new(page, worker_count))
    }

    async fn restart_monitor(&self, inner: &mut Inner) -> Result<(), BridgeError> {
        let Some(session) = inner.session.as_mut() else {
            return Err(BridgeError::Connection("no active session".to_string()));
        };
        self.monitor.start_monitoring(Arc::clone(&session.page)).await?;
        session.monitoring_active = true;
        self.set_state(ConnectionState::Connected { monitoring: true });
        Ok(())
    }

    async fn after_page_change(&self, inner: &mut Inner) {
        if inner.monitor_wanted {
            if let Err(e) = self.restart_monitor(inner).await {
                tracing::warn!("Console monitor restart after page change failed: {e}");
            }
        }
    }

    async fn teardown(&self, inner: &mut Inner, reason: &str) {
        self.monitor.stop_monitoring();
        if let Some(session) = inner.session.take() {
            session.revoked.store(true, Ordering::SeqCst);
            session.page.close().await;
            tracing::info!(session_id = %session.id, %reason, "Session torn down");
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, BridgeError>>,
) -> Result<T, BridgeError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BridgeError::timeout(operation, timeout))?
}

#[cfg(test)]
mod tests {
    use plugin_bridge_cdp::{ConsoleEvent, RuntimeEvent};
    use plugin_bridge_core::{LogQuery, LogSource};
    use serde_json::json;

    use super::*;
    use crate::testing::{MockBrowser, wait_for_len};

    fn manager(browser: &Arc<MockBrowser>) -> ConnectionManager<MockBrowser> {
        ConnectionManager::new(
            Arc::clone(browser),
            Arc::new(LogBuffer::new(100)),
            &BridgeConfig::default(),
        )
    }

    fn log(message: &str) -> RuntimeEvent {
        RuntimeEvent::Console(ConsoleEvent {
            kind: "log".into(),
            args: vec![json!(message)],
            stack_trace: None,
            origin: None,
            worker: None,
            timestamp: None,
        })
    }

    #[tokio::test]
    async fn test_connects_to_page_with_most_workers() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        browser.add_page("P2", "https://app/design/b", 3);
        let manager = manager(&browser);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let handle = manager.ensure_connection().await.unwrap();
        assert_eq!(handle.target().id, "P2");
        assert_eq!(
            manager.state(),
            ConnectionState::Connected { monitoring: false }
        );
    }

    #[tokio::test]
    async fn test_healthy_session_is_reused() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = manager(&browser);

        let first = manager.ensure_connection().await.unwrap();
        let second = manager.ensure_connection().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(browser.attached().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_health_check_rebuilds_and_restarts_monitor() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = manager(&browser);

        let old = manager.start_monitoring().await.unwrap();
        let old_page = browser.last_page();
        old_page.set_healthy(false);

        let new = manager.ensure_connection().await.unwrap();
        assert_ne!(old.id(), new.id());
        assert!(old.is_revoked());
        assert_eq!(browser.last_page().enable_calls(), 1);
        assert_eq!(
            manager.state(),
            ConnectionState::Connected { monitoring: true }
        );
    }

    #[tokio::test]
    async fn test_stale_handle_never_succeeds_after_force_reconnect() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = manager(&browser);

        let old = manager.ensure_connection().await.unwrap();
        let new = manager.force_reconnect().await.unwrap();

        let err = old
            .evaluate("figma.root.name", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StaleReference(_)));
        assert!(
            new.evaluate("figma.root.name", Duration::from_secs(1))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_opens_blank_page_when_none_exist() {
        let browser = MockBrowser::new();
        let manager = manager(&browser);

        let handle = manager.ensure_connection().await.unwrap();
        assert_eq!(handle.target().url, "about:blank");
        assert_eq!(browser.blank_pages(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_leaves_disconnected() {
        let browser = MockBrowser::new();
        browser.set_unreachable(true);
        let manager = manager(&browser);

        let err = manager.ensure_connection().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reevaluate_switches_without_clearing_history() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = manager(&browser);
        manager.start_monitoring().await.unwrap();

        browser.last_page().emit(log("before switch"));
        wait_for_len(manager.buffer(), 1).await;

        browser.add_page("P2", "https://app/design/b", 4);
        assert!(manager.reevaluate().await.unwrap());
        assert_eq!(manager.current().await.unwrap().target().id, "P2");

        browser.last_page().emit(log("after switch"));
        wait_for_len(manager.buffer(), 2).await;
        let entries = manager.buffer().query(&LogQuery::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "before switch");
        assert_eq!(entries[1].source, LogSource::Unknown);
    }

    #[tokio::test]
    async fn test_reevaluate_respects_hysteresis() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 4);
        let manager = manager(&browser);
        manager.ensure_connection().await.unwrap();

        browser.add_page("P2", "https://app/design/b", 5);
        assert!(!manager.reevaluate().await.unwrap());
        assert_eq!(manager.current().await.unwrap().target().id, "P1");
    }

    #[tokio::test]
    async fn test_navigate_restarts_monitor() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = manager(&browser);
        manager.start_monitoring().await.unwrap();

        manager.navigate("https://app/design/b").await.unwrap();
        let page = browser.last_page();
        assert_eq!(page.navigations(), vec!["https://app/design/b".to_string()]);
        assert_eq!(page.enable_calls(), 2);

        manager.reload().await.unwrap();
        assert_eq!(page.enable_calls(), 3);
    }

    #[tokio::test]
    async fn test_stop_monitoring_and_status() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 2);
        let manager = manager(&browser);
        manager.start_monitoring().await.unwrap();

        let status = manager.status().await;
        assert!(status.monitoring);
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.target_id.as_deref(), Some("P1"));

        assert!(manager.stop_monitoring().await);
        assert_eq!(
            manager.state(),
            ConnectionState::Connected { monitoring: false }
        );
        assert!(!manager.status().await.monitoring);

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_page_detach_publishes_monitoring_stopped() {
        let browser = MockBrowser::new();
        browser.add_page("P1", "https://app/design/a", 1);
        let manager = manager(&browser);
        manager.start_monitoring().await.unwrap();
        let mut state = manager.subscribe_state();
        assert_eq!(
            *state.borrow_and_update(),
            ConnectionState::Connected { monitoring: true }
        );

        browser.last_page().emit(RuntimeEvent::Detached {
            reason: "target closed".into(),
        });
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ConnectionState::Connected { monitoring: false }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!manager.status().await.monitoring);

        manager.start_monitoring().await.unwrap();
        assert_eq!(
            manager.state(),
            ConnectionState::Connected { monitoring: true }
        );
    }
}
