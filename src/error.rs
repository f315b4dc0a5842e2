use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Unsupported document {0}: no page anchors matching [id^=\"scalePage\"]")]
    UnsupportedDocument(String),

    #[error("Page {page} capture failed: {reason}")]
    PageCaptureFailure { page: u32, reason: String },

    #[error("Background asset fetch failed: {0}")]
    AssetFetchFailure(String),

    #[error("Session failure: {0}")]
    SessionFailure(String),

    #[error("Capture pool is not running")]
    PoolNotRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CaptureError {
    /// Session-level failures the pool may re-queue. Page and asset failures
    /// are absorbed where they happen and never reach the pool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::SessionFailure(_)
                | CaptureError::Timeout(_)
                | CaptureError::BrowserLaunchFailed(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::UnsupportedDocument(_) => ErrorSeverity::Low,
            CaptureError::Cancelled => ErrorSeverity::Low,
            CaptureError::InvalidUrl(_) => ErrorSeverity::Low,
            CaptureError::AssetFetchFailure(_) => ErrorSeverity::Low,
            CaptureError::ConfigurationError(_) => ErrorSeverity::High,
            CaptureError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            CaptureError::PoolNotRunning => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::AssetFetchFailure(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::SessionFailure(err.to_string())
    }
}
