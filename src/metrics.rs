use metrics::{
    decrement_gauge, describe_counter, describe_gauge, histogram, increment_counter,
    increment_gauge,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

use crate::{CaptureError, DocumentStatus, PageOutcome};

/// Pool counters, mirrored to the `metrics` facade and kept locally so the CLI
/// can print a summary without an exporter.
#[derive(Debug, Default)]
pub struct Metrics {
    documents_completed: AtomicUsize,
    documents_unsupported: AtomicUsize,
    documents_failed: AtomicUsize,
    pages_captured: AtomicUsize,
    pages_abandoned: AtomicUsize,
    capture_retries: AtomicUsize,
    task_retries: AtomicUsize,
    active_documents: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        describe_counter!("flipbook_documents_total", "Documents that reached a terminal state");
        describe_counter!("flipbook_pages_total", "Pages resolved, by outcome");
        describe_counter!("flipbook_capture_retries_total", "Page capture retries");
        describe_counter!("flipbook_task_retries_total", "Tasks re-queued after a session failure");
        describe_gauge!("flipbook_active_documents", "Documents currently being processed");
        Self::default()
    }

    pub fn record_document(&self, status: DocumentStatus, duration: Duration) {
        let (counter, label) = match status {
            DocumentStatus::Completed => (&self.documents_completed, "completed"),
            DocumentStatus::Unsupported => (&self.documents_unsupported, "unsupported"),
            _ => (&self.documents_failed, "failed"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        increment_counter!("flipbook_documents_total", "status" => label);
        histogram!("flipbook_document_seconds", duration.as_secs_f64());
    }

    pub fn record_page(&self, outcome: PageOutcome) {
        match outcome {
            PageOutcome::Success => {
                self.pages_captured.fetch_add(1, Ordering::Relaxed);
                increment_counter!("flipbook_pages_total", "outcome" => "captured");
            }
            PageOutcome::Abandoned => {
                self.pages_abandoned.fetch_add(1, Ordering::Relaxed);
                increment_counter!("flipbook_pages_total", "outcome" => "abandoned");
            }
            PageOutcome::Retrying => {}
        }
    }

    pub fn record_capture_retry(&self) {
        self.capture_retries.fetch_add(1, Ordering::Relaxed);
        increment_counter!("flipbook_capture_retries_total");
    }

    pub fn record_task_retry(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
        increment_counter!("flipbook_task_retries_total");
    }

    pub fn document_started(&self) {
        self.active_documents.fetch_add(1, Ordering::Relaxed);
        increment_gauge!("flipbook_active_documents", 1.0);
    }

    pub fn document_finished(&self) {
        self.active_documents.fetch_sub(1, Ordering::Relaxed);
        decrement_gauge!("flipbook_active_documents", 1.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_completed: self.documents_completed.load(Ordering::Relaxed),
            documents_unsupported: self.documents_unsupported.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            pages_captured: self.pages_captured.load(Ordering::Relaxed),
            pages_abandoned: self.pages_abandoned.load(Ordering::Relaxed),
            capture_retries: self.capture_retries.load(Ordering::Relaxed),
            task_retries: self.task_retries.load(Ordering::Relaxed),
            active_documents: self.active_documents.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub documents_completed: usize,
    pub documents_unsupported: usize,
    pub documents_failed: usize,
    pub pages_captured: usize,
    pub pages_abandoned: usize,
    pub capture_retries: usize,
    pub task_retries: usize,
    pub active_documents: usize,
}

/// Serve the Prometheus scrape endpoint on `addr`.
pub fn install_prometheus_exporter(addr: SocketAddr) -> Result<(), CaptureError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CaptureError::ConfigurationError(e.to_string()))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
