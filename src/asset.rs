//! Background asset download
//!
//! The viewer draws each book over a backdrop image. It is saved next to the
//! pages by a task running alongside pagination; its outcome never affects the
//! page loop.

use crate::{
    parse_css_url, CaptureError, DocumentNavigator, EventContext, EventKind, OutcomeReporter,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct AssetFetcher {
    client: reqwest::Client,
    reporter: OutcomeReporter,
    download_timeout: Duration,
}

/// A download running on its own task. Dropping it aborts the task.
#[derive(Debug)]
pub struct BackgroundDownload {
    url: Url,
    destination: PathBuf,
    handle: JoinHandle<()>,
}

impl BackgroundDownload {
    /// Abort the task and wait for it to go away. Returns `true` when the
    /// transfer was cut off before it finished.
    async fn cancel(&mut self) -> bool {
        self.handle.abort();
        match (&mut self.handle).await {
            Ok(()) => false,
            Err(e) if e.is_cancelled() => true,
            Err(e) => {
                warn!("Background task for {} ended abnormally: {}", self.url, e);
                false
            }
        }
    }
}

impl Drop for BackgroundDownload {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl AssetFetcher {
    pub fn new(
        reporter: OutcomeReporter,
        download_timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(30))
            .timeout(download_timeout)
            .no_proxy()
            .build()
            .map_err(|e| CaptureError::ConfigurationError(e.to_string()))?;

        Ok(Self {
            client,
            reporter,
            download_timeout,
        })
    }

    /// Read the backdrop URL from the page. A missing, unreadable or
    /// unparseable backdrop is reported and yields `None`; only cancellation
    /// is returned as an error.
    pub async fn locate(
        &self,
        nav: &dyn DocumentNavigator,
        source_url: &str,
    ) -> Result<Option<Url>, CaptureError> {
        let css = match nav.background_image_css().await {
            Ok(css) => css,
            Err(CaptureError::Cancelled) => return Err(CaptureError::Cancelled),
            Err(e) => {
                self.reporter.error(
                    EventKind::BackgroundFailed,
                    "Could not read the background image style",
                    EventContext::new().url(source_url).stack(&e),
                );
                return Ok(None);
            }
        };

        let url = css.as_deref().and_then(parse_css_url);
        if url.is_none() {
            self.reporter.info(
                EventKind::BackgroundMissing,
                "No background image URL found",
                EventContext::new().url(source_url),
            );
        }
        Ok(url)
    }

    /// Start the download without waiting for it.
    pub fn spawn(&self, url: Url, destination: PathBuf) -> BackgroundDownload {
        let fetcher = self.clone();
        let task_url = url.clone();
        let task_destination = destination.clone();
        let handle = tokio::spawn(async move {
            fetcher.fetch(&task_url, &task_destination).await;
        });

        BackgroundDownload {
            url,
            destination,
            handle,
        }
    }

    /// Wait for a download once the pages are done. A transfer still running
    /// after the download timeout is cut off, its partial file removed and
    /// the failure reported.
    pub async fn join(&self, mut download: BackgroundDownload) {
        match timeout(self.download_timeout, &mut download.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Background task for {} ended abnormally: {}", download.url, e)
            }
            Err(_) => {
                if download.cancel().await {
                    remove_partial(&download.destination).await;
                    let err = CaptureError::Timeout(self.download_timeout);
                    self.reporter.error(
                        EventKind::BackgroundFailed,
                        "Background image download did not finish",
                        EventContext::new()
                            .url(download.url.as_str())
                            .file(&download.destination)
                            .stack(&err),
                    );
                }
            }
        }
    }

    /// Stop a download for a document that did not complete.
    pub async fn discard(&self, mut download: BackgroundDownload) {
        if download.cancel().await {
            remove_partial(&download.destination).await;
        }
    }

    /// Stream `url` into `destination`. Every outcome is reported; a failed
    /// transfer leaves no partial file behind.
    pub async fn fetch(&self, url: &Url, destination: &Path) {
        match self.download(url, destination).await {
            Ok(bytes) => {
                self.reporter.info(
                    EventKind::BackgroundSaved,
                    "Downloaded and saved background image",
                    EventContext::new()
                        .url(url.as_str())
                        .file(destination)
                        .with("bytes", bytes),
                );
            }
            Err(e) => {
                remove_partial(destination).await;
                self.reporter.error(
                    EventKind::BackgroundFailed,
                    "Background image download failed",
                    EventContext::new()
                        .url(url.as_str())
                        .file(destination)
                        .stack(&e),
                );
            }
        }
    }

    async fn download(&self, url: &Url, destination: &Path) -> Result<u64, CaptureError> {
        let mut file = fs::File::create(destination).await?;

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

async fn remove_partial(destination: &Path) {
    if let Err(e) = fs::remove_file(destination).await {
        debug!(
            "No partial background file to remove at {}: {}",
            destination.display(),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventLevel, MockDocumentNavigator};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fetcher(reporter: OutcomeReporter) -> AssetFetcher {
        AssetFetcher::new(reporter, Duration::from_millis(500)).unwrap()
    }

    /// Answer one request with `body` as a PNG.
    async fn serve_once(body: &'static [u8]) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/bg.png")).unwrap()
    }

    #[tokio::test]
    async fn test_locate_reports_missing_background() {
        let reporter = OutcomeReporter::new(8);
        let mut events = reporter.subscribe();
        let fetcher = fetcher(reporter);

        let mut nav = MockDocumentNavigator::new();
        nav.expect_background_image_css().returning(|| Ok(None));

        let url = fetcher.locate(&nav, "https://site.example/doc").await.unwrap();
        assert!(url.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::BackgroundMissing);
        assert_eq!(event.level, EventLevel::Info);
    }

    #[tokio::test]
    async fn test_locate_parses_css_url() {
        let fetcher = fetcher(OutcomeReporter::new(8));

        let mut nav = MockDocumentNavigator::new();
        nav.expect_background_image_css()
            .returning(|| Ok(Some(r#"url("https://cdn.example/bg.jpg")"#.to_string())));

        let url = fetcher.locate(&nav, "https://site.example/doc").await.unwrap();
        assert_eq!(url.unwrap().as_str(), "https://cdn.example/bg.jpg");
    }

    #[tokio::test]
    async fn test_locate_absorbs_style_lookup_error() {
        let reporter = OutcomeReporter::new(8);
        let mut events = reporter.subscribe();
        let fetcher = fetcher(reporter);

        let mut nav = MockDocumentNavigator::new();
        nav.expect_background_image_css()
            .times(1)
            .returning(|| Err(CaptureError::SessionFailure("evaluate failed".to_string())));

        let url = fetcher.locate(&nav, "https://site.example/doc").await.unwrap();
        assert!(url.is_none());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::BackgroundFailed);
        assert_eq!(event.level, EventLevel::Error);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_locate_passes_cancellation_through() {
        let fetcher = fetcher(OutcomeReporter::new(8));

        let mut nav = MockDocumentNavigator::new();
        nav.expect_background_image_css()
            .returning(|| Err(CaptureError::Cancelled));

        let result = fetcher.locate(&nav, "https://site.example/doc").await;
        assert!(matches!(result, Err(CaptureError::Cancelled)));
    }

    #[tokio::test]
    async fn test_download_saves_background() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("book_background.png");

        let reporter = OutcomeReporter::new(8);
        let mut events = reporter.subscribe();
        let fetcher = fetcher(reporter);

        let url = serve_once(b"\x89PNG-backdrop").await;
        fetcher.join(fetcher.spawn(url, destination.clone())).await;

        assert_eq!(std::fs::read(&destination).unwrap(), b"\x89PNG-backdrop");
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::BackgroundSaved);
        assert_eq!(event.context.get("bytes"), Some("13"));
    }

    #[tokio::test]
    async fn test_failed_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("book_background.png");

        let reporter = OutcomeReporter::new(8);
        let mut events = reporter.subscribe();
        let fetcher = fetcher(reporter);

        // Nothing listens on port 9 of the loopback interface.
        let url = Url::parse("http://127.0.0.1:9/bg.png").unwrap();
        fetcher.join(fetcher.spawn(url, destination.clone())).await;

        assert!(!destination.exists());
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::BackgroundFailed);
        assert_eq!(event.level, EventLevel::Error);
        assert!(event.context.get("stack").is_some());
    }

    #[tokio::test]
    async fn test_stalled_download_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("book_background.png");

        let reporter = OutcomeReporter::new(8);
        let mut events = reporter.subscribe();
        let fetcher = AssetFetcher::new(reporter, Duration::from_millis(200)).unwrap();

        // Accepts the connection and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let url = Url::parse(&format!("http://{addr}/bg.png")).unwrap();
        let started = std::time::Instant::now();
        fetcher.join(fetcher.spawn(url, destination.clone())).await;
        server.abort();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!destination.exists());
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::BackgroundFailed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_discard_removes_unfinished_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("book_background.png");

        let reporter = OutcomeReporter::new(8);
        let mut events = reporter.subscribe();
        let fetcher = AssetFetcher::new(reporter, Duration::from_secs(30)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let url = Url::parse(&format!("http://{addr}/bg.png")).unwrap();
        let download = fetcher.spawn(url, destination.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        fetcher.discard(download).await;
        server.abort();

        assert!(!destination.exists());
        assert!(events.try_recv().is_err());
    }
}
