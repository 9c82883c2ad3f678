//! Fixed-capacity circular log buffer with live broadcast.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::log_entry::{LogEntry, LogLevel};

/// Capacity of the live broadcast channel.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Level filter for buffer queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelFilter {
    #[default]
    All,
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl LevelFilter {
    #[must_use]
    pub const fn matches(self, level: LogLevel) -> bool {
        matches!(
            (self, level),
            (Self::All, _)
                | (Self::Log, LogLevel::Log)
                | (Self::Info, LogLevel::Info)
                | (Self::Warn, LogLevel::Warn)
                | (Self::Error, LogLevel::Error)
                | (Self::Debug, LogLevel::Debug)
        )
    }
}

/// Query over buffered entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    /// Maximum number of entries, most recent kept.
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub level: LevelFilter,
    /// Minimum timestamp (epoch millis, inclusive).
    #[serde(default)]
    pub since: Option<i64>,
}

impl LogQuery {
    #[must_use]
    pub fn recent(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub const fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    fn accepts(&self, entry: &LogEntry) -> bool {
        self.level.matches(entry.level) && self.since.is_none_or(|since| entry.timestamp >= since)
    }
}

/// Point-in-time buffer statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub len: usize,
    pub capacity: usize,
    pub total_pushed: u64,
    pub evicted: u64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    total_pushed: u64,
    evicted: u64,
}

/// Circular log buffer.
///
/// One producer (the console monitor) and any number of readers. Readers
/// always work on a snapshot cloned under the read lock, so a concurrent
/// push is never observed half-applied.
pub struct LogBuffer {
    capacity: usize,
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogEntry>,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            capacity,
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(4096)),
                total_pushed: 0,
                evicted: 0,
            }),
            sender,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an entry, evicting the oldest when full.
    ///
    /// Live listeners are notified while the write lock is still held, so a
    /// reader that snapshots and subscribes under the read lock sees every
    /// entry exactly once.
    pub fn push(&self, entry: LogEntry) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
            inner.evicted += 1;
        }
        inner.entries.push_back(entry.clone());
        inner.total_pushed += 1;
        let _ = self.sender.send(entry);
    }

    /// Entries matching `query`, in chronological order.
    #[must_use]
    pub fn query(&self, query: &LogQuery) -> Vec<LogEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let limit = query.count.unwrap_or(usize::MAX);
        let mut out: Vec<LogEntry> = inner
            .entries
            .iter()
            .rev()
            .filter(|e| query.accepts(e))
            .take(limit)
            .cloned()
            .collect();
        drop(inner);
        out.reverse();
        out
    }

    /// Remove every entry and return how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        BufferStats {
            len: inner.entries.len(),
            capacity: self.capacity,
            total_pushed: inner.total_pushed,
            evicted: inner.evicted,
            oldest: inner.entries.front().map(|e| e.timestamp),
            newest: inner.entries.back().map(|e| e.timestamp),
        }
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    /// Collect entries pushed during the next `duration`.
    ///
    /// This is a bounded wait on the live channel; it never holds the buffer
    /// lock, so pushes and other readers proceed concurrently.
    pub async fn watch(&self, duration: Duration, query: &LogQuery) -> Vec<LogEntry> {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + duration;
        let mut seen = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(entry)) => {
                    if query.accepts(&entry) {
                        seen.push(entry);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "console watch lagged behind producer");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }

        if let Some(limit) = query.count {
            let excess = seen.len().saturating_sub(limit);
            seen.drain(..excess);
        }
        seen
    }

    /// Stream that yields the current history, then live entries.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LogEntry> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<LogEntry> = inner.entries.iter().cloned().collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// SSE stream (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn sse_stream(
        &self,
    ) -> futures::stream::BoxStream<'static, Result<axum::response::sse::Event, std::io::Error>>
    {
        self.history_plus_stream()
            .map(|entry| {
                axum::response::sse::Event::default()
                    .event("log")
                    .json_data(&entry)
                    .map_err(std::io::Error::other)
            })
            .boxed()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_entry::LogSource;

    fn entry(msg: &str, level: LogLevel, ts: i64) -> LogEntry {
        LogEntry::new(level, msg, LogSource::Plugin).with_timestamp(ts)
    }

    fn messages(entries: &[LogEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.message.as_str()).collect()
    }

    #[test]
    fn test_overflow_keeps_most_recent_in_order() {
        let buffer = LogBuffer::new(3);
        for (i, msg) in ["A", "B", "C", "D", "E"].iter().enumerate() {
            buffer.push(entry(msg, LogLevel::Log, i as i64));
        }

        let got = buffer.query(&LogQuery::recent(10));
        assert_eq!(messages(&got), ["C", "D", "E"]);
        assert_eq!(buffer.stats().evicted, 2);
        assert_eq!(buffer.stats().total_pushed, 5);
    }

    #[test]
    fn test_retains_exactly_capacity_for_long_sequences() {
        for capacity in [1, 2, 7, 50] {
            let buffer = LogBuffer::new(capacity);
            let total = capacity * 3 + 1;
            for i in 0..total {
                buffer.push(entry(&i.to_string(), LogLevel::Log, i as i64));
            }
            let got = buffer.query(&LogQuery::default());
            let expected: Vec<String> = (total - capacity..total).map(|i| i.to_string()).collect();
            assert_eq!(
                got.iter().map(|e| e.message.clone()).collect::<Vec<_>>(),
                expected
            );
        }
    }

    #[test]
    fn test_count_returns_most_recent_matching() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry("e1", LogLevel::Error, 1));
        buffer.push(entry("l1", LogLevel::Log, 2));
        buffer.push(entry("e2", LogLevel::Error, 3));
        buffer.push(entry("e3", LogLevel::Error, 4));
        buffer.push(entry("l2", LogLevel::Log, 5));

        let got = buffer.query(&LogQuery::recent(2).level(LevelFilter::Error));
        assert_eq!(messages(&got), ["e2", "e3"]);

        let got = buffer.query(&LogQuery::recent(0));
        assert!(got.is_empty());
    }

    #[test]
    fn test_since_filter_is_inclusive() {
        let buffer = LogBuffer::new(10);
        for ts in 1..=5 {
            buffer.push(entry(&ts.to_string(), LogLevel::Info, ts));
        }
        let got = buffer.query(&LogQuery::default().since(4));
        assert_eq!(messages(&got), ["4", "5"]);
    }

    #[test]
    fn test_clear_returns_removed_count() {
        let buffer = LogBuffer::new(4);
        buffer.push(entry("a", LogLevel::Log, 1));
        buffer.push(entry("b", LogLevel::Log, 2));
        assert_eq!(buffer.clear(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.clear(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = LogBuffer::new(0);
        buffer.push(entry("a", LogLevel::Log, 1));
        buffer.push(entry("b", LogLevel::Log, 2));
        assert_eq!(messages(&buffer.query(&LogQuery::default())), ["b"]);
    }

    #[test]
    fn test_level_filter_deserializes_all() {
        let query: LogQuery = serde_json::from_str(r#"{"level":"all","count":5}"#).unwrap();
        assert_eq!(query.level, LevelFilter::All);
        assert_eq!(query.count, Some(5));
    }

    #[tokio::test]
    async fn test_watch_collects_only_new_entries() {
        let buffer = std::sync::Arc::new(LogBuffer::new(10));
        buffer.push(entry("before", LogLevel::Log, 1));

        let producer = std::sync::Arc::clone(&buffer);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(entry("during", LogLevel::Log, 2));
            producer.push(entry("noise", LogLevel::Debug, 3));
        });

        let got = buffer
            .watch(
                Duration::from_millis(150),
                &LogQuery::default().level(LevelFilter::Log),
            )
            .await;
        handle.await.unwrap();
        assert_eq!(messages(&got), ["during"]);
    }

    #[tokio::test]
    async fn test_history_plus_stream_replays_then_follows() {
        let buffer = LogBuffer::new(10);
        buffer.push(entry("old", LogLevel::Log, 1));

        let mut stream = buffer.history_plus_stream();
        buffer.push(entry("new", LogLevel::Log, 2));

        assert_eq!(stream.next().await.unwrap().message, "old");
        assert_eq!(stream.next().await.unwrap().message, "new");
    }

    #[tokio::test]
    async fn test_stream_during_concurrent_pushes_has_no_gaps_or_duplicates() {
        const TOTAL: i64 = 500;
        let buffer = std::sync::Arc::new(LogBuffer::new(1000));
        let producer = std::sync::Arc::clone(&buffer);
        let writer = std::thread::spawn(move || {
            for i in 0..TOTAL {
                producer.push(entry(&i.to_string(), LogLevel::Log, i));
            }
        });

        while buffer.len() < 50 {
            tokio::task::yield_now().await;
        }
        let mut stream = buffer.history_plus_stream();
        writer.join().unwrap();

        let mut expected = 0;
        while expected < TOTAL {
            let got = stream.next().await.unwrap();
            assert_eq!(got.timestamp, expected);
            expected += 1;
        }
    }
}
