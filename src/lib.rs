//! # Flipbook Capture
//!
//! Captures online flipbook documents page by page with headless Chrome. A
//! bounded pool of browser sessions works through submitted document URLs;
//! each document is detected, paginated and saved as one PNG per page plus the
//! viewer's background image.
//!
//! ## Pipeline
//!
//! | Stage | Component | Failure handling |
//! |-------|-----------|------------------|
//! | Scheduling | [`ClusterManager`] | Session failures re-queued a bounded number of times |
//! | Document | [`DocumentProcessor`] | Unsupported documents end cleanly |
//! | Page | [`CaptureEngine`] | Up to 3 retries, then the page is skipped |
//! | Backdrop | [`AssetFetcher`] | Reported, never affects pagination |
//! | Reporting | [`OutcomeReporter`] | One final event per failure path |
//!
//! ## Output layout
//!
//! ```text
//! {downloads}/{app_namespace}/book/{safe_title}___{unix_ms}/
//!     {safe_title}_background.png
//!     {safe_title}-1.png
//!     {safe_title}-2.png
//!     ...
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flipbook_capture::{ClusterManager, Config, StopMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = ClusterManager::with_chrome(Config::default())?;
//!     let mut events = cluster.subscribe();
//!
//!     cluster.start().await?;
//!     cluster.submit("https://online.fliphtml5.com/abcde/fghij/")?;
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{:?} {}", event.kind, event.message);
//!         }
//!     });
//!
//!     cluster.stop(StopMode::Graceful).await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! flipbook-capture capture --url https://online.fliphtml5.com/abcde/fghij/
//! flipbook-capture --concurrency 4 batch --input books.txt
//! flipbook-capture --events-json watch < urls.txt
//! ```

/// Configuration and browser launch settings
pub mod config;

/// Error types and error classification
pub mod error;

/// Structured outcome events
pub mod events;

/// Browser navigation capability and its Chrome implementation
pub mod navigator;

/// Browser pool management for per-worker Chrome instances
pub mod browser_pool;

/// Per-page capture with bounded retry
pub mod capture;

/// Background image download
pub mod asset;

/// Document state machine
pub mod document;

/// Worker pool and task scheduling
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Pool counters and Prometheus export
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use asset::*;
pub use browser_pool::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use document::*;
pub use error::*;
pub use events::*;
pub use metrics::*;
pub use navigator::*;
pub use utils::*;
pub use worker::*;
