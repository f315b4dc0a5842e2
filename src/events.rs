//! Structured outcome events
//!
//! Every notable transition of the pool, a document or a page is published as
//! a [`StructuredEvent`]. Events are mirrored to `tracing` and broadcast to any
//! number of subscribers; publishing never waits on a subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PoolStarted,
    PoolStopped,
    TaskSubmitted,
    TaskRetried,
    TaskFailed,
    TaskCancelled,
    DocumentUnsupported,
    PagesUnknown,
    DocumentComplete,
    PageCaptured,
    PageRetrying,
    PageAbandoned,
    BackgroundSaved,
    BackgroundMissing,
    BackgroundFailed,
}

/// Auxiliary fields attached to an event, kept in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventContext(BTreeMap<String, String>);

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn url(self, url: &str) -> Self {
        self.with("url", url)
    }

    pub fn title(self, title: &str) -> Self {
        self.with("title", title)
    }

    pub fn file(self, path: &Path) -> Self {
        self.with("file", path.display())
    }

    pub fn stack(self, err: impl fmt::Display) -> Self {
        self.with("stack", err)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// An immutable record of one notable occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredEvent {
    /// Monotonic per-reporter sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub kind: EventKind,
    pub message: String,
    pub context: EventContext,
}

/// Append-only event sink shared by the pool, its workers and their tasks.
#[derive(Debug, Clone)]
pub struct OutcomeReporter {
    tx: broadcast::Sender<StructuredEvent>,
    seq: Arc<AtomicU64>,
}

impl OutcomeReporter {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Receivers that fall behind by more than the buffer see
    /// `RecvError::Lagged` and lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<StructuredEvent> {
        self.tx.subscribe()
    }

    pub fn emit(
        &self,
        level: EventLevel,
        kind: EventKind,
        message: impl Into<String>,
        context: EventContext,
    ) -> StructuredEvent {
        let event = StructuredEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            level,
            kind,
            message: message.into(),
            context,
        };

        match level {
            EventLevel::Info => info!(kind = ?event.kind, "{} {}", event.message, event.context),
            EventLevel::Warn => warn!(kind = ?event.kind, "{} {}", event.message, event.context),
            EventLevel::Error => error!(kind = ?event.kind, "{} {}", event.message, event.context),
        }

        // No subscriber is not an error
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn info(&self, kind: EventKind, message: impl Into<String>, context: EventContext) {
        self.emit(EventLevel::Info, kind, message, context);
    }

    pub fn warn(&self, kind: EventKind, message: impl Into<String>, context: EventContext) {
        self.emit(EventLevel::Warn, kind, message, context);
    }

    pub fn error(&self, kind: EventKind, message: impl Into<String>, context: EventContext) {
        self.emit(EventLevel::Error, kind, message, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let reporter = OutcomeReporter::new(4);
        let event = reporter.emit(
            EventLevel::Info,
            EventKind::PoolStarted,
            "started",
            EventContext::new(),
        );
        assert_eq!(event.seq, 0);
        assert_eq!(event.kind, EventKind::PoolStarted);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let reporter = OutcomeReporter::new(16);
        let mut rx = reporter.subscribe();

        reporter.info(EventKind::TaskSubmitted, "one", EventContext::new().url("https://a"));
        reporter.warn(EventKind::PageRetrying, "two", EventContext::new().with("retry", 1));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq + 1, second.seq);
        assert_eq!(first.context.get("url"), Some("https://a"));
        assert_eq!(second.level, EventLevel::Warn);
        assert_eq!(second.context.get("retry"), Some("1"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let reporter = OutcomeReporter::new(2);
        let mut rx = reporter.subscribe();

        for i in 0..5 {
            reporter.info(EventKind::PageCaptured, format!("page {i}"), EventContext::new());
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_context_display_is_sorted() {
        let ctx = EventContext::new()
            .with("url", "https://b")
            .with("file", "/tmp/x.png")
            .title("Book");
        assert_eq!(ctx.to_string(), "file=/tmp/x.png title=Book url=https://b");
    }

    #[test]
    fn test_event_serializes_to_json() {
        let reporter = OutcomeReporter::new(1);
        let event = reporter.emit(
            EventLevel::Error,
            EventKind::PageAbandoned,
            "gave up",
            EventContext::new().with("page", 3),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["level"], "error");
        assert_eq!(json["kind"], "page_abandoned");
        assert_eq!(json["context"]["page"], "3");
    }
}
