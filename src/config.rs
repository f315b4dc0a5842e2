//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration for the capture pool: worker count,
//! retry limits, render settle delays, the emulated device and the output
//! layout under the downloads folder.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// User agent of the emulated iPhone 12 Pro.
pub const IPHONE_12_PRO_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Mobile/15E148 Safari/604.1";

/// Main configuration structure for the capture pool
///
/// # Examples
///
/// ```rust
/// use flipbook_capture::Config;
///
/// let config = Config {
///     concurrency_limit: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of documents processed at the same time, one browser per worker (default: 2)
    pub concurrency_limit: usize,

    /// Upper bound for one document run; expiry counts as a session failure (default: 1 hour)
    pub session_timeout: Duration,

    /// Per-page capture retries after the first attempt (default: 3)
    pub max_capture_retries: usize,

    /// How many times a task is re-queued after a session failure (default: 2)
    pub task_retry_limit: usize,

    /// Fixed wait before every capture attempt so the page can finish its
    /// turn animation (default: 5 seconds)
    pub settle_delay: Duration,

    /// Wait after jumping to the first page (default: 2 seconds)
    pub navigation_settle: Duration,

    /// How long to wait for a page anchor to appear (default: 30 seconds)
    pub anchor_timeout: Duration,

    /// CDP request timeout, bounds a single navigation (default: 60 seconds)
    pub navigation_timeout: Duration,

    /// Page number forced into the `#p=` fragment on first load so the viewer
    /// renders every page anchor (default: 999)
    pub max_page_hint: u32,

    /// Bounds one background image download, and how long a finished
    /// document waits for it (default: 60 seconds)
    pub background_timeout: Duration,

    /// How long an immediate stop waits for workers before aborting them (default: 10 seconds)
    pub stop_grace: Duration,

    /// Emulated device
    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// User-Agent override (default: iPhone 12 Pro Safari)
    pub user_agent: Option<String>,

    /// Run Chrome without a visible window (default: true)
    pub headless: bool,

    /// Root for captured books; `None` resolves to the user's downloads folder
    pub downloads_root: Option<PathBuf>,

    /// Folder created under the downloads root (default: "iceCoffee")
    pub app_namespace: String,

    /// Prefix every submitted URL must carry
    pub url_prefix: String,

    /// Capacity of the event broadcast buffer (default: 1024)
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
            session_timeout: Duration::from_secs(60 * 60),
            max_capture_retries: 3,
            task_retry_limit: 2,
            settle_delay: Duration::from_secs(5),
            navigation_settle: Duration::from_secs(2),
            anchor_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(60),
            max_page_hint: 999,
            background_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: Some(IPHONE_12_PRO_USER_AGENT.to_string()),
            headless: true,
            downloads_root: None,
            app_namespace: "iceCoffee".to_string(),
            url_prefix: "https://online.fliphtml5.com/".to_string(),
            event_buffer: 1024,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.concurrency_limit == 0 {
            return Err(CaptureError::ConfigurationError(
                "Concurrency limit must be greater than 0".to_string(),
            ));
        }

        if self.session_timeout.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "Session timeout must be greater than 0".to_string(),
            ));
        }

        if self.background_timeout.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "Background timeout must be greater than 0".to_string(),
            ));
        }

        if self.anchor_timeout.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "Anchor timeout must be greater than 0".to_string(),
            ));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(CaptureError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        if self.max_page_hint == 0 {
            return Err(CaptureError::ConfigurationError(
                "Max page hint must be greater than 0".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(CaptureError::ConfigurationError(
                "Event buffer must hold at least one event".to_string(),
            ));
        }

        if self.app_namespace.trim().is_empty() {
            return Err(CaptureError::ConfigurationError(
                "App namespace must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// `{downloads}/{app_namespace}/book`, the parent of every book folder.
    pub fn books_root(&self) -> PathBuf {
        let downloads = self
            .downloads_root
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("downloads"));

        downloads.join(&self.app_namespace).join("book")
    }
}

/// Emulated device metrics applied to every page
///
/// Defaults to an iPhone 12 Pro, the layout the flipbook viewer renders one
/// page per screen for.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 390,
            height: 844,
            device_scale_factor: 3.0,
            mobile: true,
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use flipbook_capture::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default(), 0);
/// assert!(args.contains(&"--mute-audio".to_string()));
/// ```
pub fn get_chrome_args(config: &Config, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    vec![
        "--disable-extensions".to_string(),
        "--disable-gpu".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-accelerated-2d-canvas".to_string(),
        "--disable-infobars".to_string(),
        "--window-position=0,0".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--mute-audio".to_string(),
        "--no-first-run".to_string(),
        "--disable-features=ProcessSingleton".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width * 2,
            config.viewport.height * 2
        ),
        format!("--temp-dir=/tmp/flipbook-capture-temp-{}", unique_id),
    ]
}

pub fn user_data_dir(instance_id: usize) -> PathBuf {
    std::env::temp_dir().join(format!(
        "flipbook-capture-profile-{}-{}",
        std::process::id(),
        instance_id
    ))
}

pub fn create_browser_config(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width * 2, config.viewport.height * 2)
        .user_data_dir(user_data_dir(instance_id))
        .request_timeout(config.navigation_timeout)
        .args(get_chrome_args(config, instance_id));

    if !config.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::ConfigurationError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.max_capture_retries, 3);
        assert_eq!(config.settle_delay, Duration::from_secs(5));
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_page_hint, 999);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_viewport_default_is_iphone() {
        let viewport = Viewport::default();
        assert_eq!(viewport.width, 390);
        assert_eq!(viewport.height, 844);
        assert_eq!(viewport.device_scale_factor, 3.0);
        assert!(viewport.mobile);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CaptureError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_books_root_layout() {
        let config = Config {
            downloads_root: Some(PathBuf::from("/data/dl")),
            ..Default::default()
        };
        assert_eq!(config.books_root(), PathBuf::from("/data/dl/iceCoffee/book"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"concurrency_limit": 5}"#).unwrap();
        assert_eq!(config.concurrency_limit, 5);
        assert_eq!(config.max_capture_retries, 3);
        assert_eq!(config.app_namespace, "iceCoffee");
    }

    #[test]
    fn test_chrome_args_generation() {
        let config = Config::default();
        let args = get_chrome_args(&config, 1);
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.contains(&"--window-size=780,1688".to_string()));
    }
}
