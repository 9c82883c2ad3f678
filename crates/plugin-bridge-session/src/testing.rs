//! In-memory debugging transport for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use plugin_bridge_cdp::{DebugBrowser, DebugPage, RuntimeEvent, TargetInfo, WorkerInfo};
use plugin_bridge_core::{BridgeError, ImageFormat, LogBuffer};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::manager::HEALTH_CHECK_EXPRESSION;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a page target.
#[must_use]
pub fn page_target(id: &str, url: &str) -> TargetInfo {
    TargetInfo {
        id: id.to_string(),
        target_type: "page".to_string(),
        title: String::new(),
        url: url.to_string(),
        web_socket_debugger_url: Some(format!("ws://mock/{id}")),
    }
}

/// Wait (up to one second) until `buffer` holds at least `len` entries.
pub async fn wait_for_len(buffer: &LogBuffer, len: usize) {
    for _ in 0..200 {
        if buffer.len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A scripted page.
pub struct MockPage {
    target: TargetInfo,
    events: broadcast::Sender<RuntimeEvent>,
    workers: Mutex<Vec<WorkerInfo>>,
    closed: AtomicBool,
    healthy: AtomicBool,
    fail_enable: AtomicBool,
    enable_calls: AtomicUsize,
    evaluations: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<Result<Value, BridgeError>>>,
    navigations: Mutex<Vec<String>>,
    screenshot: Mutex<Option<String>>,
}

impl MockPage {
    #[must_use]
    pub fn new(id: &str, url: &str) -> Arc<Self> {
        Self::from_target(page_target(id, url))
    }

    #[must_use]
    pub fn from_target(target: TargetInfo) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            target,
            events,
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            fail_enable: AtomicBool::new(false),
            enable_calls: AtomicUsize::new(0),
            evaluations: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            navigations: Mutex::new(Vec::new()),
            screenshot: Mutex::new(None),
        })
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_workers(&self, count: usize) {
        *lock(&self.workers) = (0..count)
            .map(|i| WorkerInfo {
                session_id: format!("{}-W{i}", self.target.id),
                target_id: format!("{}-T{i}", self.target.id),
                url: format!("blob:worker-{i}"),
            })
            .collect();
    }

    /// Queue the result of the next non-health-check evaluation.
    pub fn push_response(&self, response: Result<Value, BridgeError>) {
        lock(&self.responses).push_back(response);
    }

    pub fn set_screenshot(&self, data: &str) {
        *lock(&self.screenshot) = Some(data.to_string());
    }

    #[must_use]
    pub fn enable_calls(&self) -> usize {
        self.enable_calls.load(Ordering::SeqCst)
    }

    /// Expressions evaluated so far, excluding health checks.
    #[must_use]
    pub fn evaluations(&self) -> Vec<String> {
        lock(&self.evaluations).clone()
    }

    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        lock(&self.navigations).clone()
    }

    fn check_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::StaleReference(format!(
                "page {} is closed",
                self.target.id
            )));
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection(format!(
                "page {} is unresponsive",
                self.target.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DebugPage for MockPage {
    fn target(&self) -> &TargetInfo {
        &self.target
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn enable_runtime(&self) -> Result<(), BridgeError> {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("Runtime.enable failed".to_string()));
        }
        Ok(())
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        lock(&self.workers).clone()
    }

    async fn evaluate(&self, expression: &str, _timeout: Duration) -> Result<Value, BridgeError> {
        self.check_open()?;
        if expression == HEALTH_CHECK_EXPRESSION {
            return Ok(Value::from(2));
        }
        lock(&self.evaluations).push(expression.to_string());
        lock(&self.responses)
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), BridgeError> {
        self.check_open()?;
        lock(&self.navigations).push(url.to_string());
        Ok(())
    }

    async fn reload(&self, _timeout: Duration) -> Result<(), BridgeError> {
        self.check_open()?;
        lock(&self.navigations).push("reload".to_string());
        Ok(())
    }

    async fn screenshot(
        &self,
        _format: ImageFormat,
        _timeout: Duration,
    ) -> Result<String, BridgeError> {
        self.check_open()?;
        lock(&self.screenshot)
            .clone()
            .ok_or_else(|| BridgeError::Protocol("no screenshot scripted".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.emit(RuntimeEvent::Detached {
            reason: "closed".to_string(),
        });
    }
}

/// A scripted browser. Every `attach` creates a fresh [`MockPage`].
#[derive(Default)]
pub struct MockBrowser {
    targets: Mutex<Vec<TargetInfo>>,
    worker_counts: Mutex<HashMap<String, usize>>,
    attached: Mutex<Vec<Arc<MockPage>>>,
    scripted: Mutex<Vec<Result<Value, BridgeError>>>,
    probed: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    blank_pages: AtomicUsize,
}

impl MockBrowser {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a page target with a worker count.
    pub fn add_page(&self, id: &str, url: &str, workers: usize) {
        lock(&self.targets).push(page_target(id, url));
        self.set_workers(id, workers);
    }

    pub fn add_target(&self, target: TargetInfo) {
        lock(&self.targets).push(target);
    }

    pub fn remove_page(&self, id: &str) {
        lock(&self.targets).retain(|t| t.id != id);
    }

    /// Set the worker count for `id`, including pages already attached to it.
    pub fn set_workers(&self, id: &str, workers: usize) {
        lock(&self.worker_counts).insert(id.to_string(), workers);
        for page in lock(&self.attached).iter().filter(|p| p.target.id == id) {
            page.set_workers(workers);
        }
    }

    /// Targets whose workers were counted by a probe connection, in order.
    #[must_use]
    pub fn probed(&self) -> Vec<String> {
        lock(&self.probed).clone()
    }

    /// Queue `response` on every page attached from now on.
    pub fn respond_on_attach(&self, response: Result<Value, BridgeError>) {
        lock(&self.scripted).push(response);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Pages handed out by `attach`, oldest first.
    #[must_use]
    pub fn attached(&self) -> Vec<Arc<MockPage>> {
        lock(&self.attached).clone()
    }

    /// The most recently attached page.
    ///
    /// # Panics
    /// Panics if nothing has been attached yet.
    #[must_use]
    pub fn last_page(&self) -> Arc<MockPage> {
        lock(&self.attached)
            .last()
            .cloned()
            .expect("no page attached yet")
    }

    #[must_use]
    pub fn blank_pages(&self) -> usize {
        self.blank_pages.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), BridgeError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection(
                "remote-debugging endpoint refused connection".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DebugBrowser for MockBrowser {
    async fn list_targets(&self) -> Result<Vec<TargetInfo>, BridgeError> {
        self.check_reachable()?;
        Ok(lock(&self.targets).clone())
    }

    async fn attach(&self, target: &TargetInfo) -> Result<Arc<dyn DebugPage>, BridgeError> {
        self.check_reachable()?;
        let page = MockPage::from_target(target.clone());
        let workers = lock(&self.worker_counts)
            .get(&target.id)
            .copied()
            .unwrap_or(0);
        page.set_workers(workers);
        for response in lock(&self.scripted).iter() {
            page.push_response(response.clone());
        }
        lock(&self.attached).push(Arc::clone(&page));
        Ok(page)
    }

    async fn open_blank(&self) -> Result<TargetInfo, BridgeError> {
        self.check_reachable()?;
        let n = self.blank_pages.fetch_add(1, Ordering::SeqCst);
        let target = page_target(&format!("blank-{n}"), "about:blank");
        lock(&self.targets).push(target.clone());
        Ok(target)
    }

    async fn count_workers(&self, target: &TargetInfo) -> Result<usize, BridgeError> {
        self.check_reachable()?;
        lock(&self.probed).push(target.id.clone());
        Ok(lock(&self.worker_counts)
            .get(&target.id)
            .copied()
            .unwrap_or(0))
    }
}
