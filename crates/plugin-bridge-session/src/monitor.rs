//! Console monitor: turns one page's runtime events into buffered log entries.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use plugin_bridge_cdp::{ConsoleEvent, DebugPage, ExceptionEvent, RuntimeEvent, WorkerInfo};
use plugin_bridge_core::{
    BridgeError, LogBuffer, LogEntry, LogLevel, LogSource, TruncationLimits,
    config::ConsoleConfig,
    log_entry::{format_message, now_millis},
};
use tokio::{sync::broadcast, task::JoinHandle};

/// Decides which [`LogSource`] an event came from.
#[derive(Debug, Clone)]
pub struct SourceClassifier {
    plugin_markers: Vec<String>,
    host_markers: Vec<String>,
}

impl SourceClassifier {
    #[must_use]
    pub const fn new(plugin_markers: Vec<String>, host_markers: Vec<String>) -> Self {
        Self {
            plugin_markers,
            host_markers,
        }
    }

    /// Classify by worker origin first, then by script or frame URL.
    #[must_use]
    pub fn classify(
        &self,
        worker: Option<&WorkerInfo>,
        script_url: Option<&str>,
        origin: Option<&str>,
    ) -> LogSource {
        if worker.is_some() {
            return LogSource::Plugin;
        }
        let Some(url) = [script_url, origin]
            .into_iter()
            .flatten()
            .find(|u| !u.is_empty())
        else {
            return LogSource::Unknown;
        };
        let url = url.to_ascii_lowercase();
        if self.plugin_markers.iter().any(|m| url.contains(m.as_str())) {
            LogSource::Plugin
        } else if self.host_markers.iter().any(|m| url.contains(m.as_str())) {
            LogSource::Host
        } else {
            LogSource::Page
        }
    }
}

/// Converts runtime events into log entries.
#[derive(Debug, Clone)]
struct EventProcessor {
    classifier: SourceClassifier,
    limits: TruncationLimits,
}

impl EventProcessor {
    fn console_entry(&self, event: ConsoleEvent) -> Result<LogEntry, BridgeError> {
        let timestamp = event_timestamp(event.timestamp)?;
        let args: Vec<_> = event.args.iter().map(|a| self.limits.apply(a)).collect();
        let script_url = event.stack_trace.as_ref().and_then(|s| s.top_url());
        let source = self
            .classifier
            .classify(event.worker.as_ref(), script_url, event.origin.as_deref());

        let mut entry = LogEntry::new(
            LogLevel::from_console_type(&event.kind),
            self.limits.apply_str(&format_message(&args)),
            source,
        )
        .with_timestamp(timestamp)
        .with_args(args);
        if let Some(trace) = event.stack_trace {
            entry = entry.with_stack_trace(trace);
        }
        if let Some(worker) = event.worker {
            entry = entry.with_worker_url(worker.url);
        }
        Ok(entry)
    }

    fn exception_entry(&self, event: ExceptionEvent) -> Result<LogEntry, BridgeError> {
        let timestamp = event_timestamp(event.timestamp)?;
        let message = event
            .description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or(&event.text);
        let script_url = event
            .url
            .as_deref()
            .or_else(|| event.stack_trace.as_ref().and_then(|s| s.top_url()));
        let source = self
            .classifier
            .classify(event.worker.as_ref(), script_url, None);

        let mut entry = LogEntry::new(LogLevel::Error, self.limits.apply_str(message), source)
            .with_timestamp(timestamp);
        if let Some(trace) = event.stack_trace {
            entry = entry.with_stack_trace(trace);
        }
        if let Some(worker) = event.worker {
            entry = entry.with_worker_url(worker.url);
        }
        Ok(entry)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn event_timestamp(reported: Option<f64>) -> Result<i64, BridgeError> {
    match reported {
        None => Ok(now_millis()),
        Some(ts) if ts.is_finite() && ts >= 0.0 => Ok(ts as i64),
        Some(ts) => Err(BridgeError::Protocol(format!("invalid event timestamp {ts}"))),
    }
}

/// Called with the target id when the event loop ends on its own (the page
/// detached or its connection closed). Not called after an explicit stop.
pub type ExitHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Lets a finished event loop tell whether it is still the current one.
struct ExitNotice {
    generation: u64,
    current: Arc<AtomicU64>,
    hook: Option<ExitHook>,
}

impl ExitNotice {
    fn fire(self, target_id: &str) {
        if self.current.load(Ordering::SeqCst) != self.generation {
            return;
        }
        if let Some(hook) = self.hook {
            hook(target_id);
        }
    }
}

struct ActiveMonitor {
    target_id: String,
    task: JoinHandle<()>,
}

/// Captures console output from exactly one page at a time.
///
/// Holds only a transient reference to the page; the connection manager
/// restarts it against a fresh page after any loss.
pub struct ConsoleMonitor {
    buffer: Arc<LogBuffer>,
    processor: EventProcessor,
    active: Mutex<Option<ActiveMonitor>>,
    generation: Arc<AtomicU64>,
    on_exit: Option<ExitHook>,
}

impl ConsoleMonitor {
    #[must_use]
    pub fn new(buffer: Arc<LogBuffer>, config: &ConsoleConfig) -> Self {
        Self {
            buffer,
            processor: EventProcessor {
                classifier: SourceClassifier::new(
                    config.plugin_markers.clone(),
                    config.host_markers.clone(),
                ),
                limits: config.truncation,
            },
            active: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            on_exit: None,
        }
    }

    /// Run `hook` whenever monitoring ends without [`Self::stop_monitoring`].
    #[must_use]
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.on_exit = Some(hook);
        self
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Detach from any prior page and start capturing from `page`.
    ///
    /// # Errors
    /// Returns error if the runtime subscription cannot be enabled.
    pub async fn start_monitoring(&self, page: Arc<dyn DebugPage>) -> Result<(), BridgeError> {
        self.stop_monitoring();

        let rx = page.subscribe();
        page.enable_runtime().await?;

        let target_id = page.target().id.clone();
        let notice = ExitNotice {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            current: Arc::clone(&self.generation),
            hook: self.on_exit.clone(),
        };
        let task = tokio::spawn(run_monitor(
            self.processor.clone(),
            Arc::clone(&self.buffer),
            rx,
            target_id.clone(),
            notice,
        ));

        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ActiveMonitor {
                target_id: target_id.clone(),
                task,
            });
        if let Some(previous) = previous {
            previous.task.abort();
        }

        tracing::info!(%target_id, url = %page.target().url, "Console monitoring started");
        Ok(())
    }

    /// Stop capturing. Returns whether a page was being monitored.
    pub fn stop_monitoring(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match active {
            Some(active) => {
                active.task.abort();
                tracing::info!(target_id = %active.target_id, "Console monitoring stopped");
                true
            }
            None => false,
        }
    }

    /// Whether the event loop is still running. It stops by itself when the
    /// page detaches.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    #[must_use]
    pub fn target_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.target_id.clone())
    }
}

impl Drop for ConsoleMonitor {
    fn drop(&mut self) {
        if let Some(active) = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            active.task.abort();
        }
    }
}

async fn run_monitor(
    processor: EventProcessor,
    buffer: Arc<LogBuffer>,
    mut rx: broadcast::Receiver<RuntimeEvent>,
    target_id: String,
    notice: ExitNotice,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(%target_id, skipped, "Console monitor dropped events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let entry = match event {
            RuntimeEvent::Console(console) => processor.console_entry(console),
            RuntimeEvent::Exception(exception) => processor.exception_entry(exception),
            RuntimeEvent::WorkerCreated(worker) => {
                tracing::debug!(%target_id, url = %worker.url, "Worker attached");
                continue;
            }
            RuntimeEvent::WorkerDestroyed { session_id } => {
                tracing::debug!(%target_id, %session_id, "Worker detached");
                continue;
            }
            RuntimeEvent::Detached { reason } => {
                tracing::info!(%target_id, %reason, "Monitored page detached");
                break;
            }
        };

        match entry {
            Ok(entry) => buffer.push(entry),
            Err(e) => tracing::warn!(%target_id, "Skipping console event: {e}"),
        }
    }
    notice.fire(&target_id);
}
