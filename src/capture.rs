//! Per-page capture with bounded retry
//!
//! A page is attempted at most `1 + max_retries` times. Each attempt waits the
//! fixed settle delay, waits for the page anchor, then captures the anchor's
//! bounding region. Exhausted pages are abandoned so the document can move on.

use crate::{
    cancellable, pause, CaptureError, Config, DocumentNavigator, DocumentSession, EventContext,
    EventKind, Metrics, OutcomeReporter,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Success,
    Retrying,
    Abandoned,
}

/// State of one page while it is being captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureAttempt {
    pub page_index: u32,
    pub retry_count: usize,
    pub outcome: PageOutcome,
}

impl CaptureAttempt {
    fn new(page_index: u32) -> Self {
        Self {
            page_index,
            retry_count: 0,
            outcome: PageOutcome::Retrying,
        }
    }

    pub fn attempts(&self) -> usize {
        self.retry_count + 1
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.outcome, PageOutcome::Success | PageOutcome::Abandoned)
    }
}

#[derive(Debug, Clone)]
pub struct CaptureEngine {
    settle_delay: Duration,
    anchor_timeout: Duration,
    max_retries: usize,
    reporter: OutcomeReporter,
    metrics: Arc<Metrics>,
}

impl CaptureEngine {
    pub fn new(config: &Config, reporter: OutcomeReporter, metrics: Arc<Metrics>) -> Self {
        Self {
            settle_delay: config.settle_delay,
            anchor_timeout: config.anchor_timeout,
            max_retries: config.max_capture_retries,
            reporter,
            metrics,
        }
    }

    /// Capture page `page_index` of `session`.
    ///
    /// Only cancellation is returned as an error; capture failures end in
    /// [`PageOutcome::Abandoned`].
    pub async fn capture(
        &self,
        nav: &dyn DocumentNavigator,
        session: &DocumentSession,
        page_index: u32,
        cancel: &CancellationToken,
    ) -> Result<CaptureAttempt, CaptureError> {
        let path = session.page_path(page_index).ok_or_else(|| {
            CaptureError::IoError(format!(
                "no output directory for {}",
                session.source_url
            ))
        })?;
        let selector = nav.current_page_anchor_for(page_index);
        let mut attempt = CaptureAttempt::new(page_index);

        loop {
            pause(cancel, self.settle_delay).await?;

            match self.try_capture(nav, &selector, &path, page_index, cancel).await {
                Ok(()) => {
                    attempt.outcome = PageOutcome::Success;
                    self.metrics.record_page(attempt.outcome);
                    self.reporter.info(
                        EventKind::PageCaptured,
                        format!("Captured page {}/{}", page_index, session.total_pages.unwrap_or(0)),
                        EventContext::new()
                            .url(&session.source_url)
                            .title(&session.title)
                            .file(&path)
                            .with("retry", attempt.retry_count),
                    );
                    return Ok(attempt);
                }
                Err(CaptureError::Cancelled) => return Err(CaptureError::Cancelled),
                Err(e) if attempt.retry_count < self.max_retries => {
                    attempt.retry_count += 1;
                    attempt.outcome = PageOutcome::Retrying;
                    self.metrics.record_capture_retry();
                    self.reporter.warn(
                        EventKind::PageRetrying,
                        format!(
                            "Page {} capture failed, retry {}/{}",
                            page_index, attempt.retry_count, self.max_retries
                        ),
                        EventContext::new()
                            .url(&session.source_url)
                            .title(&session.title)
                            .with("page", page_index)
                            .with("retry", attempt.retry_count)
                            .stack(&e),
                    );
                }
                Err(e) => {
                    attempt.outcome = PageOutcome::Abandoned;
                    self.metrics.record_page(attempt.outcome);
                    self.reporter.error(
                        EventKind::PageAbandoned,
                        format!(
                            "Page {} abandoned after {} attempts",
                            page_index,
                            attempt.attempts()
                        ),
                        EventContext::new()
                            .url(&session.source_url)
                            .title(&session.title)
                            .file(&path)
                            .with("page", page_index)
                            .stack(&e),
                    );
                    return Ok(attempt);
                }
            }
        }
    }

    async fn try_capture(
        &self,
        nav: &dyn DocumentNavigator,
        selector: &str,
        path: &Path,
        page_index: u32,
        cancel: &CancellationToken,
    ) -> Result<(), CaptureError> {
        let as_page_failure = |e: CaptureError| match e {
            CaptureError::Cancelled => e,
            other => CaptureError::PageCaptureFailure {
                page: page_index,
                reason: other.to_string(),
            },
        };

        cancellable(cancel, nav.wait_for_anchor(selector, self.anchor_timeout))
            .await
            .map_err(as_page_failure)?;
        cancellable(cancel, nav.capture_region(selector, path))
            .await
            .map_err(as_page_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventLevel, MockDocumentNavigator};
    use mockall::Sequence;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            settle_delay: Duration::from_millis(1),
            anchor_timeout: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn test_session() -> DocumentSession {
        let mut session = DocumentSession::new("https://site.example/doc1");
        session.title = "doc1".to_string();
        session.safe_title = "doc1".to_string();
        session.output_dir = Some(PathBuf::from("/tmp/out"));
        session.total_pages = Some(3);
        session
    }

    fn anchor_for(nav: &mut MockDocumentNavigator) {
        nav.expect_current_page_anchor_for()
            .returning(|index| format!("#scalePage{}", index - 1));
    }

    #[tokio::test]
    async fn test_abandons_after_max_retries() {
        let reporter = OutcomeReporter::new(32);
        let mut events = reporter.subscribe();
        let metrics = Arc::new(Metrics::new());
        let engine = CaptureEngine::new(&test_config(), reporter, metrics.clone());

        let mut nav = MockDocumentNavigator::new();
        anchor_for(&mut nav);
        nav.expect_wait_for_anchor()
            .times(4)
            .returning(|_, limit| Err(CaptureError::Timeout(limit)));
        nav.expect_capture_region().times(0);

        let attempt = engine
            .capture(&nav, &test_session(), 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, PageOutcome::Abandoned);
        assert_eq!(attempt.retry_count, 3);
        assert_eq!(attempt.attempts(), 4);

        let mut warnings = 0;
        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            match event.level {
                EventLevel::Warn => warnings += 1,
                EventLevel::Error => {
                    errors += 1;
                    assert_eq!(event.kind, EventKind::PageAbandoned);
                }
                EventLevel::Info => {}
            }
        }
        assert_eq!(warnings, 3);
        assert_eq!(errors, 1);
        assert_eq!(metrics.snapshot().pages_abandoned, 1);
        assert_eq!(metrics.snapshot().capture_retries, 3);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let engine = CaptureEngine::new(
            &test_config(),
            OutcomeReporter::new(32),
            Arc::new(Metrics::new()),
        );

        let mut seq = Sequence::new();
        let mut nav = MockDocumentNavigator::new();
        anchor_for(&mut nav);
        nav.expect_wait_for_anchor()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, limit| Err(CaptureError::Timeout(limit)));
        nav.expect_wait_for_anchor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        nav.expect_capture_region()
            .withf(|selector, path| {
                selector == "#scalePage0" && path == Path::new("/tmp/out/doc1-1.png")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let attempt = engine
            .capture(&nav, &test_session(), 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, PageOutcome::Success);
        assert_eq!(attempt.retry_count, 2);
        assert!(attempt.is_resolved());
    }

    #[tokio::test]
    async fn test_capture_error_is_retried() {
        let engine = CaptureEngine::new(
            &test_config(),
            OutcomeReporter::new(32),
            Arc::new(Metrics::new()),
        );

        let mut seq = Sequence::new();
        let mut nav = MockDocumentNavigator::new();
        anchor_for(&mut nav);
        nav.expect_wait_for_anchor().times(2).returning(|_, _| Ok(()));
        nav.expect_capture_region()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(CaptureError::SessionFailure("clip".to_string())));
        nav.expect_capture_region()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let attempt = engine
            .capture(&nav, &test_session(), 3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, PageOutcome::Success);
        assert_eq!(attempt.retry_count, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let engine = CaptureEngine::new(
            &test_config(),
            OutcomeReporter::new(32),
            Arc::new(Metrics::new()),
        );

        let mut nav = MockDocumentNavigator::new();
        anchor_for(&mut nav);
        nav.expect_wait_for_anchor().times(0);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine.capture(&nav, &test_session(), 1, &cancel).await;
        assert!(matches!(result, Err(CaptureError::Cancelled)));
    }
}
