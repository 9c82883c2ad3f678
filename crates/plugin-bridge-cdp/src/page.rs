//! A page attached over its own debugging socket.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use plugin_bridge_core::{BridgeError, ImageFormat, StackFrame, StackTrace};
use serde_json::{Map, Value, json};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    connection::{CONNECTION_CLOSED, CdpConnection, CdpEvent},
    target::{
        ConsoleEvent, DebugPage, ExceptionEvent, RuntimeEvent, TargetInfo, WorkerInfo,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SETUP_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_TYPES: &[&str] = &["worker", "shared_worker", "service_worker"];

#[derive(Default)]
struct PageState {
    workers: HashMap<String, WorkerInfo>,
    /// (session id, execution context id) -> origin
    contexts: HashMap<(Option<String>, i64), String>,
}

struct PageShared {
    conn: Arc<CdpConnection>,
    events: broadcast::Sender<RuntimeEvent>,
    state: Mutex<PageState>,
    runtime_enabled: AtomicBool,
}

/// A page target attached over its debugging socket.
pub struct CdpPage {
    target: TargetInfo,
    shared: Arc<PageShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl CdpPage {
    /// Connect to `target` and start tracking its workers.
    ///
    /// # Errors
    /// Returns error if the target has no socket URL or setup fails.
    pub async fn attach(target: &TargetInfo, timeout: Duration) -> Result<Self, BridgeError> {
        let ws_url = target.web_socket_debugger_url.as_deref().ok_or_else(|| {
            BridgeError::Connection(format!(
                "target {} exposes no debugging socket (another client may be attached)",
                target.id
            ))
        })?;

        let conn = CdpConnection::connect(ws_url, timeout).await?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(PageShared {
            conn: Arc::clone(&conn),
            events,
            state: Mutex::new(PageState::default()),
            runtime_enabled: AtomicBool::new(false),
        });

        let rx = conn.subscribe();
        let pump = tokio::spawn(pump_events(Arc::clone(&shared), rx));

        let page = Self {
            target: target.clone(),
            shared,
            pump: Mutex::new(Some(pump)),
        };

        conn.send("Page.enable", json!({}), None, SETUP_TIMEOUT).await?;
        conn.send(
            "Target.setAutoAttach",
            json!({ "autoAttach": true, "waitForDebuggerOnStart": false, "flatten": true }),
            None,
            SETUP_TIMEOUT,
        )
        .await?;

        tracing::info!(target_id = %target.id, url = %target.url, "Attached to page");
        Ok(page)
    }

    async fn wait_for_load(
        &self,
        mut rx: broadcast::Receiver<CdpEvent>,
        started: Instant,
        timeout: Duration,
        operation: &str,
    ) -> Result<(), BridgeError> {
        let deadline = tokio::time::Instant::from_std(started + timeout);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) if event.session_id.is_none() => match event.method.as_str() {
                    "Page.loadEventFired" => return Ok(()),
                    CONNECTION_CLOSED => {
                        return Err(BridgeError::Connection(format!(
                            "{operation}: connection closed while loading"
                        )));
                    }
                    _ => {}
                },
                Ok(Ok(_) | Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BridgeError::Connection(format!(
                        "{operation}: event stream closed"
                    )));
                }
                Err(_) => return Err(BridgeError::timeout(operation, started.elapsed())),
            }
        }
    }
}

#[async_trait]
impl DebugPage for CdpPage {
    fn target(&self) -> &TargetInfo {
        &self.target
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }

    async fn enable_runtime(&self) -> Result<(), BridgeError> {
        let conn = &self.shared.conn;
        conn.send("Runtime.enable", json!({}), None, SETUP_TIMEOUT)
            .await?;
        self.shared.runtime_enabled.store(true, Ordering::SeqCst);

        for worker in self.workers() {
            if let Err(e) = conn
                .send(
                    "Runtime.enable",
                    json!({}),
                    Some(&worker.session_id),
                    SETUP_TIMEOUT,
                )
                .await
            {
                tracing::warn!(worker = %worker.url, "Failed to enable worker runtime: {e}");
            }
        }
        Ok(())
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
            .values()
            .cloned()
            .collect()
    }

    async fn evaluate(&self, expression: &str, timeout: Duration) -> Result<Value, BridgeError> {
        let response = self
            .shared
            .conn
            .send("Runtime.evaluate", evaluate_params(expression), None, timeout)
            .await?;
        evaluation_result(response)
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BridgeError> {
        let started = Instant::now();
        let rx = self.shared.conn.subscribe();
        let response = self
            .shared
            .conn
            .send("Page.navigate", json!({ "url": url }), None, timeout)
            .await?;
        if let Some(error_text) = response.get("errorText").and_then(Value::as_str) {
            return Err(BridgeError::Connection(format!(
                "navigation to {url} failed: {error_text}"
            )));
        }
        self.wait_for_load(rx, started, timeout, "navigate").await
    }

    async fn reload(&self, timeout: Duration) -> Result<(), BridgeError> {
        let started = Instant::now();
        let rx = self.shared.conn.subscribe();
        self.shared
            .conn
            .send("Page.reload", json!({}), None, timeout)
            .await?;
        self.wait_for_load(rx, started, timeout, "reload").await
    }

    async fn screenshot(
        &self,
        format: ImageFormat,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let response = self
            .shared
            .conn
            .send(
                "Page.captureScreenshot",
                json!({ "format": format.as_str() }),
                None,
                timeout,
            )
            .await?;
        response
            .get("data")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| BridgeError::Protocol("screenshot response has no data".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.shared.conn.is_closed()
    }

    async fn close(&self) {
        self.shared.conn.close();
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        let _ = self.shared.events.send(RuntimeEvent::Detached {
            reason: "closed".to_string(),
        });
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

async fn pump_events(shared: Arc<PageShared>, mut rx: broadcast::Receiver<CdpEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let closed = event.method == CONNECTION_CLOSED;
                if let Some(runtime_event) = translate(&shared, event) {
                    let _ = shared.events.send(runtime_event);
                }
                if closed {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Page event pump lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn translate(shared: &Arc<PageShared>, event: CdpEvent) -> Option<RuntimeEvent> {
    let CdpEvent {
        method,
        params,
        session_id,
    } = event;

    match method.as_str() {
        "Target.attachedToTarget" => {
            let info = &params["targetInfo"];
            let target_type = info["type"].as_str().unwrap_or_default();
            if !WORKER_TYPES.contains(&target_type) {
                return None;
            }
            let worker = WorkerInfo {
                session_id: params["sessionId"].as_str()?.to_string(),
                target_id: info["targetId"].as_str().unwrap_or_default().to_string(),
                url: info["url"].as_str().unwrap_or_default().to_string(),
            };
            shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .workers
                .insert(worker.session_id.clone(), worker.clone());

            if shared.runtime_enabled.load(Ordering::SeqCst) {
                let conn = Arc::clone(&shared.conn);
                let worker_session = worker.session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = conn
                        .send(
                            "Runtime.enable",
                            json!({}),
                            Some(&worker_session),
                            SETUP_TIMEOUT,
                        )
                        .await
                    {
                        tracing::warn!("Failed to enable runtime on new worker: {e}");
                    }
                });
            }
            Some(RuntimeEvent::WorkerCreated(worker))
        }
        "Target.detachedFromTarget" => {
            let session_id = params["sessionId"].as_str()?.to_string();
            let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.workers.remove(&session_id)?;
            state
                .contexts
                .retain(|(sid, _), _| sid.as_deref() != Some(session_id.as_str()));
            drop(state);
            Some(RuntimeEvent::WorkerDestroyed { session_id })
        }
        "Runtime.executionContextCreated" => {
            let context = &params["context"];
            if let (Some(id), Some(origin)) = (context["id"].as_i64(), context["origin"].as_str())
            {
                shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contexts
                    .insert((session_id, id), origin.to_string());
            }
            None
        }
        "Runtime.executionContextsCleared" => {
            shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contexts
                .retain(|(sid, _), _| *sid != session_id);
            None
        }
        "Runtime.consoleAPICalled" => {
            let state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let origin = params["executionContextId"]
                .as_i64()
                .and_then(|id| state.contexts.get(&(session_id.clone(), id)).cloned());
            let worker = session_id
                .as_ref()
                .and_then(|sid| state.workers.get(sid).cloned());
            drop(state);

            let args = params["args"]
                .as_array()
                .map(|args| args.iter().map(remote_object_value).collect())
                .unwrap_or_default();
            Some(RuntimeEvent::Console(ConsoleEvent {
                kind: params["type"].as_str().unwrap_or("log").to_string(),
                args,
                stack_trace: parse_stack_trace(&params["stackTrace"]),
                origin,
                worker,
                timestamp: params["timestamp"].as_f64(),
            }))
        }
        "Runtime.exceptionThrown" => {
            let details = &params["exceptionDetails"];
            let worker = session_id.as_ref().and_then(|sid| {
                shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .workers
                    .get(sid)
                    .cloned()
            });
            Some(RuntimeEvent::Exception(ExceptionEvent {
                text: details["text"].as_str().unwrap_or("Uncaught").to_string(),
                description: details["exception"]["description"]
                    .as_str()
                    .map(ToString::to_string),
                url: details["url"].as_str().map(ToString::to_string),
                stack_trace: parse_stack_trace(&details["stackTrace"]),
                worker,
                timestamp: params["timestamp"].as_f64(),
            }))
        }
        "Inspector.detached" if session_id.is_none() => Some(RuntimeEvent::Detached {
            reason: params["reason"].as_str().unwrap_or("detached").to_string(),
        }),
        CONNECTION_CLOSED => Some(RuntimeEvent::Detached {
            reason: params["reason"]
                .as_str()
                .unwrap_or("connection closed")
                .to_string(),
        }),
        _ => None,
    }
}

/// `Runtime.evaluate` parameters. No `contextId` and no session id, so the
/// expression runs in the main frame's default context.
fn evaluate_params(expression: &str) -> Value {
    json!({
        "expression": expression,
        "returnByValue": true,
        "awaitPromise": true,
    })
}

/// Unwrap a `Runtime.evaluate` response into its returned value.
fn evaluation_result(response: Value) -> Result<Value, BridgeError> {
    if let Some(details) = response.get("exceptionDetails") {
        let description = details["exception"]["description"]
            .as_str()
            .map(ToString::to_string);
        let message = description
            .as_deref()
            .and_then(|d| d.lines().next())
            .or_else(|| details["text"].as_str())
            .unwrap_or("Uncaught exception")
            .to_string();
        return Err(BridgeError::Execution {
            message,
            stack: description,
        });
    }

    let result = response
        .get("result")
        .ok_or_else(|| BridgeError::Protocol("evaluate response has no result".to_string()))?;
    Ok(remote_object_value(result))
}

/// Best-effort JSON rendering of a protocol `RemoteObject`.
fn remote_object_value(obj: &Value) -> Value {
    if let Some(value) = obj.get("value") {
        return value.clone();
    }
    if let Some(unserializable) = obj.get("unserializableValue").and_then(Value::as_str) {
        return Value::String(unserializable.to_string());
    }
    if let Some(properties) = obj["preview"]["properties"].as_array() {
        let is_array = obj["subtype"].as_str() == Some("array");
        let rendered = properties.iter().map(|p| {
            (
                p["name"].as_str().unwrap_or_default().to_string(),
                p.get("value").cloned().unwrap_or(Value::Null),
            )
        });
        return if is_array {
            Value::Array(rendered.map(|(_, v)| v).collect())
        } else {
            Value::Object(rendered.collect::<Map<String, Value>>())
        };
    }
    match obj["type"].as_str() {
        Some("undefined") | None => Value::Null,
        Some(kind) => Value::String(
            obj["description"]
                .as_str()
                .unwrap_or(kind)
                .to_string(),
        ),
    }
}

fn parse_stack_trace(raw: &Value) -> Option<StackTrace> {
    let frames: Vec<StackFrame> = raw["callFrames"]
        .as_array()?
        .iter()
        .map(|f| StackFrame {
            function_name: f["functionName"].as_str().unwrap_or_default().to_string(),
            url: f["url"].as_str().unwrap_or_default().to_string(),
            line_number: f["lineNumber"]
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            column_number: f["columnNumber"]
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
        })
        .collect();
    (!frames.is_empty()).then_some(StackTrace { frames })
}
