//! Document state machine
//!
//! One [`DocumentProcessor::process`] call drives a single flipbook:
//!
//! ```text
//! Navigate -> DetectStructure -> Unsupported
//!                             -> ExtractMetadata -> IteratePages -> Completed
//! ```
//!
//! Any navigation or browser failure ends the run with a session failure that
//! the pool decides to retry or abandon. A failed run leaves no output folder
//! behind.

use crate::{
    cancellable, format_duration, page_count_from_anchors, pause, sanitize_title, title_from_url,
    update_page_param, AssetFetcher, BackgroundDownload, CaptureEngine, CaptureError, Config,
    DocumentNavigator, EventContext, EventKind, Metrics, OutcomeReporter, PageOutcome, Task,
};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const UNTITLED: &str = "untitled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Detecting,
    Paginating,
    Completed,
    Unsupported,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DocumentStatus::Completed | DocumentStatus::Unsupported | DocumentStatus::Failed
        )
    }
}

/// Working state of one document, dropped once the run ends.
#[derive(Debug)]
pub struct DocumentSession {
    pub source_url: String,
    pub title: String,
    pub safe_title: String,
    pub output_dir: Option<PathBuf>,
    /// Fixed once detection completes. `None` means the count could not be read.
    pub total_pages: Option<u32>,
    pub current_page: u32,
    pub status: DocumentStatus,
    background: Option<BackgroundDownload>,
}

impl DocumentSession {
    pub fn new(source_url: &str) -> Self {
        Self {
            source_url: source_url.to_string(),
            title: String::new(),
            safe_title: String::new(),
            output_dir: None,
            total_pages: None,
            current_page: 0,
            status: DocumentStatus::Detecting,
            background: None,
        }
    }

    /// `{output_dir}/{safe_title}-{index}.png`
    pub fn page_path(&self, index: u32) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.png", self.safe_title, index)))
    }

    /// `{output_dir}/{safe_title}_background.png`
    pub fn background_path(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_background.png", self.safe_title)))
    }

    fn transition(&mut self, status: DocumentStatus) {
        debug!(
            "Document {} {:?} -> {:?}",
            self.source_url, self.status, status
        );
        self.status = status;
    }
}

/// Final summary of one document run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentReport {
    pub url: String,
    pub status: DocumentStatus,
    pub title: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub total_pages: Option<u32>,
    pub captured: u32,
    pub abandoned: u32,
}

#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    max_page_hint: u32,
    navigation_settle: Duration,
    session_timeout: Duration,
    books_root: PathBuf,
    capture: CaptureEngine,
    assets: AssetFetcher,
    reporter: OutcomeReporter,
}

impl DocumentProcessor {
    pub fn new(
        config: &Config,
        assets: AssetFetcher,
        reporter: OutcomeReporter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            max_page_hint: config.max_page_hint,
            navigation_settle: config.navigation_settle,
            session_timeout: config.session_timeout,
            books_root: config.books_root(),
            capture: CaptureEngine::new(config, reporter.clone(), metrics),
            assets,
            reporter,
        }
    }

    /// Run `task` to a terminal state.
    ///
    /// Unsupported documents are a normal outcome and return `Ok`. Errors are
    /// session failures (for the pool to retry), local I/O failures, or
    /// `Cancelled`. A run longer than `session_timeout` is a session failure.
    pub async fn process(
        &self,
        task: &Task,
        nav: &dyn DocumentNavigator,
        cancel: &CancellationToken,
    ) -> Result<DocumentReport, CaptureError> {
        let started = Instant::now();
        let mut session = DocumentSession::new(&task.url);

        let result = match timeout(self.session_timeout, self.run(&mut session, nav, cancel)).await
        {
            Ok(result) => result,
            Err(_) => Err(CaptureError::SessionFailure(format!(
                "document run exceeded {:?}",
                self.session_timeout
            ))),
        };
        match &result {
            Ok(report) if report.status == DocumentStatus::Completed => {
                self.reporter.info(
                    EventKind::DocumentComplete,
                    format!(
                        "Completed {}: {} captured, {} abandoned",
                        session.title, report.captured, report.abandoned
                    ),
                    EventContext::new()
                        .url(&task.url)
                        .title(&session.title)
                        .with(
                            "dir",
                            report
                                .output_dir
                                .as_ref()
                                .map(|dir| dir.display().to_string())
                                .unwrap_or_default(),
                        )
                        .with("pages", report.total_pages.unwrap_or(0))
                        .with("elapsed", format_duration(started.elapsed())),
                );
            }
            Ok(_) => {}
            Err(err) => self.teardown(&mut session, err).await,
        }
        result
    }

    /// Stop the background download. A failed run also loses its output
    /// folder so a retry starts from a clean slate.
    async fn teardown(&self, session: &mut DocumentSession, err: &CaptureError) {
        if let Some(download) = session.background.take() {
            self.assets.discard(download).await;
        }
        if matches!(err, CaptureError::Cancelled) {
            return;
        }

        session.transition(DocumentStatus::Failed);
        if let Some(dir) = session.output_dir.take() {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => debug!("Removed partial output {}", dir.display()),
                Err(e) => warn!("Could not remove partial output {}: {}", dir.display(), e),
            }
        }
    }

    async fn finish_background(&self, session: &mut DocumentSession) {
        if let Some(download) = session.background.take() {
            self.assets.join(download).await;
        }
    }

    async fn run(
        &self,
        session: &mut DocumentSession,
        nav: &dyn DocumentNavigator,
        cancel: &CancellationToken,
    ) -> Result<DocumentReport, CaptureError> {
        // Navigate
        let target = update_page_param(&session.source_url, self.max_page_hint);
        cancellable(cancel, nav.open(&target))
            .await
            .map_err(as_session_failure)?;

        // DetectStructure
        let anchors = cancellable(cancel, nav.page_anchor_ids())
            .await
            .map_err(as_session_failure)?;
        if anchors.is_empty() {
            session.transition(DocumentStatus::Unsupported);
            let err = CaptureError::UnsupportedDocument(session.source_url.clone());
            self.reporter.info(
                EventKind::DocumentUnsupported,
                "Unsupported document: expected page anchors with ids scalePage0..scalePageN",
                EventContext::new().url(&session.source_url).stack(&err),
            );
            return Ok(report(session, 0, 0));
        }

        // ExtractMetadata
        session.title = cancellable(cancel, nav.title())
            .await
            .map_err(as_session_failure)?;
        session.safe_title = Some(sanitize_title(&session.title))
            .filter(|t| !t.is_empty())
            .or_else(|| title_from_url(&session.source_url))
            .unwrap_or_else(|| UNTITLED.to_string());
        if session.title.is_empty() {
            session.title = session.safe_title.clone();
        }

        session.total_pages = match page_count_from_anchors(&anchors) {
            Some(count) => Some(count),
            None => cancellable(cancel, nav.page_param())
                .await
                .map_err(as_session_failure)?,
        };

        let output_dir = create_output_dir(&self.books_root, &session.safe_title, Utc::now())
            .await
            .map_err(|e| CaptureError::IoError(e.to_string()))?;
        debug!("Saving {} into {}", session.source_url, output_dir.display());
        session.output_dir = Some(output_dir);

        let background_url =
            cancellable(cancel, self.assets.locate(nav, &session.source_url)).await?;
        if let (Some(url), Some(path)) = (background_url, session.background_path()) {
            session.background = Some(self.assets.spawn(url, path));
        }

        let Some(total_pages) = session.total_pages else {
            self.reporter.warn(
                EventKind::PagesUnknown,
                "Could not read the page count, no pages captured",
                EventContext::new()
                    .url(&session.source_url)
                    .title(&session.title)
                    .with("anchors", anchors.len()),
            );
            session.transition(DocumentStatus::Completed);
            self.finish_background(session).await;
            return Ok(report(session, 0, 0));
        };

        // IteratePages
        session.transition(DocumentStatus::Paginating);
        cancellable(cancel, nav.goto_page(1))
            .await
            .map_err(as_session_failure)?;
        pause(cancel, self.navigation_settle).await?;

        let mut captured = 0;
        let mut abandoned = 0;
        session.current_page = 1;
        while session.current_page <= total_pages {
            let attempt = self
                .capture
                .capture(nav, session, session.current_page, cancel)
                .await?;
            match attempt.outcome {
                PageOutcome::Success => captured += 1,
                PageOutcome::Abandoned => abandoned += 1,
                PageOutcome::Retrying => {}
            }

            cancellable(cancel, nav.next_page())
                .await
                .map_err(as_session_failure)?;
            session.current_page += 1;
        }

        session.transition(DocumentStatus::Completed);
        self.finish_background(session).await;
        Ok(report(session, captured, abandoned))
    }
}

fn report(session: &DocumentSession, captured: u32, abandoned: u32) -> DocumentReport {
    DocumentReport {
        url: session.source_url.clone(),
        status: session.status,
        title: Some(session.title.clone()).filter(|t| !t.is_empty()),
        output_dir: session.output_dir.clone(),
        total_pages: session.total_pages,
        captured,
        abandoned,
    }
}

/// Browser-side errors during navigation are session failures; cancellation
/// and already-classified failures pass through.
fn as_session_failure(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::Cancelled | CaptureError::SessionFailure(_) => err,
        other => CaptureError::SessionFailure(other.to_string()),
    }
}

/// Create `{root}/{safe_title}___{millis}`, bumping the timestamp until the
/// name is free so concurrent runs of the same title never share a folder.
pub async fn create_output_dir(
    root: &Path,
    safe_title: &str,
    created_at: DateTime<Utc>,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(root).await?;

    let mut stamp = created_at.timestamp_millis();
    loop {
        let candidate = root.join(format!("{safe_title}___{stamp}"));
        match fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => stamp += 1,
            Err(e) => return Err(e),
        }
    }
}
