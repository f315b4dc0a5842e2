//! Browser navigation capability used by the document state machine
//!
//! [`DocumentNavigator`] hides how a flipbook is driven: loading it, finding
//! its page anchors, moving between pages and capturing an anchor's region.
//! [`ChromeNavigator`] implements it on top of a chromiumoxide [`Page`].

use crate::{CaptureError, Config};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::Page;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Id prefix shared by every page anchor of a supported document.
pub const PAGE_ANCHOR_PREFIX: &str = "scalePage";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The network counts as idle once no resource has finished loading for this long.
const NETWORK_QUIET: Duration = Duration::from_millis(500);

const RESOURCE_COUNT_JS: &str = "performance.getEntriesByType('resource').length";

const ANCHOR_IDS_JS: &str = r#"Array.from(document.querySelectorAll('[id^="scalePage"]')).map((el) => el.id)"#;

const PAGE_PARAM_JS: &str =
    "new URLSearchParams(window.location.hash.substring(1)).get('p') || ''";

const BACKGROUND_IMAGE_JS: &str = r#"(() => {
    const container = document.getElementById('bacgradient');
    const last = container ? container.lastElementChild : null;
    if (!last) {
        return '';
    }
    return window.getComputedStyle(last).backgroundImage || '';
})()"#;

/// Drives one flipbook inside one browser session.
///
/// Pages are numbered from 1; the anchor of page `n` is `#scalePage{n-1}`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentNavigator: Send + Sync {
    /// Load `url` and return once the load has settled.
    async fn open(&self, url: &str) -> Result<(), CaptureError>;

    /// Ids of every element following the page anchor convention.
    async fn page_anchor_ids(&self) -> Result<Vec<String>, CaptureError>;

    /// Page number the viewer currently shows in its `#p=` fragment.
    async fn page_param(&self) -> Result<Option<u32>, CaptureError>;

    async fn title(&self) -> Result<String, CaptureError>;

    /// Raw computed `background-image` of the viewer backdrop, if any.
    async fn background_image_css(&self) -> Result<Option<String>, CaptureError>;

    /// Jump straight to page `index`.
    async fn goto_page(&self, index: u32) -> Result<(), CaptureError>;

    /// Advance one page with a forward key press.
    async fn next_page(&self) -> Result<(), CaptureError>;

    /// Wait until `selector` exists or `limit` elapses.
    async fn wait_for_anchor(&self, selector: &str, limit: Duration) -> Result<(), CaptureError>;

    /// Capture the bounding region of `selector` as a PNG at `path`.
    async fn capture_region(&self, selector: &str, path: &Path) -> Result<(), CaptureError>;

    /// Release the underlying page.
    async fn close(&self);

    fn current_page_anchor_for(&self, index: u32) -> String {
        format!("#{}{}", PAGE_ANCHOR_PREFIX, index.saturating_sub(1))
    }
}

/// Page count implied by the anchors present: highest index + 1.
///
/// `None` when no id carries a numeric suffix.
pub fn page_count_from_anchors<S: AsRef<str>>(ids: &[S]) -> Option<u32> {
    ids.iter()
        .filter_map(|id| id.as_ref().strip_prefix(PAGE_ANCHOR_PREFIX))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .map(|highest| highest + 1)
}

/// Tracks the loaded-resource count between polls.
#[derive(Debug)]
struct NetworkIdle {
    last_count: Option<u64>,
    quiet_since: Instant,
}

impl NetworkIdle {
    fn new(now: Instant) -> Self {
        Self {
            last_count: None,
            quiet_since: now,
        }
    }

    /// Record a poll; `true` once the count has held for [`NETWORK_QUIET`].
    fn observe(&mut self, count: u64, now: Instant) -> bool {
        if self.last_count != Some(count) {
            self.last_count = Some(count);
            self.quiet_since = now;
            return false;
        }
        now.duration_since(self.quiet_since) >= NETWORK_QUIET
    }
}

pub struct ChromeNavigator {
    page: Page,
    navigation_settle: Duration,
    network_idle_limit: Duration,
}

impl ChromeNavigator {
    /// Wrap a fresh page and apply the configured device emulation.
    pub async fn new(page: Page, config: &Config) -> Result<Self, CaptureError> {
        let viewport = &config.viewport;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::SessionFailure)?;
        page.execute(metrics).await?;

        if viewport.mobile {
            page.execute(SetTouchEmulationEnabledParams::new(true)).await?;
        }

        if let Some(user_agent) = &config.user_agent {
            page.execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await?;
        }

        Ok(Self {
            page,
            navigation_settle: config.navigation_settle,
            network_idle_limit: config.navigation_timeout,
        })
    }

    async fn eval_string(&self, expression: &str) -> Result<String, CaptureError> {
        let result = self.page.evaluate(expression).await?;
        Ok(result.into_value::<String>()?)
    }

    /// Wait until the resource count stops changing for [`NETWORK_QUIET`].
    /// The viewer keeps fetching page images after the load event fires.
    async fn wait_for_network_idle(&self) -> Result<(), CaptureError> {
        let started = Instant::now();
        let mut tracker = NetworkIdle::new(started);

        loop {
            let count = self
                .page
                .evaluate(RESOURCE_COUNT_JS)
                .await?
                .into_value::<u64>()?;
            if tracker.observe(count, Instant::now()) {
                return Ok(());
            }

            if started.elapsed() >= self.network_idle_limit {
                debug!("Network still busy after {:?}, continuing", self.network_idle_limit);
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl DocumentNavigator for ChromeNavigator {
    async fn open(&self, url: &str) -> Result<(), CaptureError> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        self.wait_for_network_idle().await
    }

    async fn page_anchor_ids(&self) -> Result<Vec<String>, CaptureError> {
        let result = self.page.evaluate(ANCHOR_IDS_JS).await?;
        Ok(result.into_value::<Vec<String>>()?)
    }

    async fn page_param(&self) -> Result<Option<u32>, CaptureError> {
        let raw = self.eval_string(PAGE_PARAM_JS).await?;
        Ok(raw.trim().parse::<u32>().ok())
    }

    async fn title(&self) -> Result<String, CaptureError> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn background_image_css(&self) -> Result<Option<String>, CaptureError> {
        let raw = self.eval_string(BACKGROUND_IMAGE_JS).await?;
        Ok(Some(raw).filter(|css| !css.is_empty() && css != "none"))
    }

    async fn goto_page(&self, index: u32) -> Result<(), CaptureError> {
        self.page
            .evaluate(format!("window.location.hash = 'p={index}'"))
            .await?;

        // A fragment change may not fire a load event; settle either way.
        if timeout(self.navigation_settle, self.page.wait_for_navigation())
            .await
            .is_err()
        {
            debug!("No navigation event after jumping to page {}", index);
        }
        Ok(())
    }

    async fn next_page(&self) -> Result<(), CaptureError> {
        let body = self.page.find_element("body").await?;
        body.press_key("ArrowRight").await?;
        Ok(())
    }

    async fn wait_for_anchor(&self, selector: &str, limit: Duration) -> Result<(), CaptureError> {
        let started = Instant::now();
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if started.elapsed() >= limit {
                return Err(CaptureError::Timeout(limit));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn capture_region(&self, selector: &str, path: &Path) -> Result<(), CaptureError> {
        let element = self.page.find_element(selector).await?;
        element
            .save_screenshot(CaptureScreenshotFormat::Png, path)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            debug!("Page close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count_from_anchors() {
        let ids = ["scalePage0", "scalePage1", "scalePage4", "scalePage2"];
        assert_eq!(page_count_from_anchors(&ids), Some(5));
    }

    #[test]
    fn test_page_count_ignores_unparseable_anchors() {
        assert_eq!(page_count_from_anchors(&["scalePageX", "scalePage"]), None);
        assert_eq!(page_count_from_anchors(&["scalePageX", "scalePage0"]), Some(1));
        assert_eq!(page_count_from_anchors::<&str>(&[]), None);
    }

    #[test]
    fn test_network_idle_needs_a_quiet_window() {
        let start = Instant::now();
        let mut idle = NetworkIdle::new(start);

        assert!(!idle.observe(3, start));
        assert!(!idle.observe(3, start + Duration::from_millis(200)));
        // A newly finished resource restarts the window.
        assert!(!idle.observe(4, start + Duration::from_millis(400)));
        assert!(!idle.observe(4, start + Duration::from_millis(800)));
        assert!(idle.observe(4, start + Duration::from_millis(900)));
    }
}
