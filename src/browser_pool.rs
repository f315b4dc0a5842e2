//! Browser pool management for concurrent Chrome instances
//!
//! Each pool worker gets its own Chrome instance, launched the first time the
//! worker asks for a session and relaunched when it crashes or a session
//! failure is reported against it.

use crate::{
    create_browser_config, CaptureError, ChromeNavigator, Config, DocumentNavigator,
    SessionFactory,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Instance is ready and available for use
    Healthy,
    /// Instance is serving a worker's session
    Busy,
    /// Instance has failed and is relaunched on next use
    Failed,
}

/// A single Chrome browser instance owned by one worker slot
#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Background task handling Chrome DevTools Protocol communication
    pub handler: tokio::task::JoinHandle<()>,
    pub last_used: Instant,
    pub sessions_opened: usize,
    pub status: InstanceStatus,
    pub created_at: Instant,
    pub failure_count: usize,
}

impl BrowserInstance {
    pub fn new(id: usize, browser: Browser, handler: tokio::task::JoinHandle<()>) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            last_used: Instant::now(),
            sessions_opened: 0,
            status: InstanceStatus::Healthy,
            created_at: Instant::now(),
            failure_count: 0,
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.sessions_opened += 1;
        self.status = InstanceStatus::Busy;
    }

    pub fn mark_failed(&mut self) {
        self.failure_count += 1;
        self.status = InstanceStatus::Failed;
    }

    /// A crashed CDP handler means the browser process is gone.
    pub fn is_usable(&self) -> bool {
        !matches!(self.status, InstanceStatus::Failed) && !self.handler.is_finished()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.browser.lock().await.close().await {
            debug!("Browser instance {} close failed: {}", self.id, e);
        }
        self.handler.abort();
    }
}

pub struct BrowserPool {
    instances: Mutex<Vec<Option<BrowserInstance>>>,
    config: Config,
    is_shutting_down: AtomicBool,
}

impl BrowserPool {
    /// No browser is launched until a worker asks for a page.
    pub fn new(config: Config) -> Self {
        let slots = (0..config.concurrency_limit).map(|_| None).collect();
        Self {
            instances: Mutex::new(slots),
            config,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    async fn create_browser_instance(&self, id: usize) -> Result<BrowserInstance, CaptureError> {
        let browser_config = create_browser_config(&self.config, id)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        // The handler implements Stream and must be polled for the browser to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser {} handler error: {}", id, e);
                }
            }
            debug!("Browser {} handler stream ended", id);
        });

        info!("Browser instance {} launched", id);
        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    /// Open a blank page on the worker's browser, launching or relaunching it
    /// as needed.
    pub async fn new_page(&self, instance_id: usize) -> Result<Page, CaptureError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::SessionFailure(
                "browser pool is shutting down".to_string(),
            ));
        }

        let browser = {
            let mut instances = self.instances.lock().await;
            if instance_id >= instances.len() {
                instances.resize_with(instance_id + 1, || None);
            }

            let slot = &mut instances[instance_id];
            if !slot.as_ref().is_some_and(BrowserInstance::is_usable) {
                if let Some(stale) = slot.take() {
                    warn!("Browser instance {} unusable, relaunching", instance_id);
                    stale.shutdown().await;
                }
                *slot = Some(self.create_browser_instance(instance_id).await?);
            }

            match slot.as_mut() {
                Some(instance) => {
                    instance.mark_used();
                    instance.browser.clone()
                }
                None => return Err(CaptureError::SessionFailure("browser slot empty".to_string())),
            }
        };

        let browser = browser.lock().await;
        Ok(browser.new_page("about:blank").await?)
    }

    /// Flag the instance so the next session request relaunches it.
    pub async fn restart_instance(&self, instance_id: usize) {
        let mut instances = self.instances.lock().await;
        if let Some(Some(instance)) = instances.get_mut(instance_id) {
            instance.mark_failed();
            info!(
                "Browser instance {} scheduled for relaunch after {} failures (age {:?})",
                instance_id,
                instance.failure_count,
                instance.age()
            );
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        let mut instances = self.instances.lock().await;
        for instance in instances.iter_mut().filter_map(Option::take) {
            instance.shutdown().await;
        }

        info!("Browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;

        let mut stats = BrowserPoolStats::default();
        for instance in instances.iter().flatten() {
            stats.launched_instances += 1;
            stats.sessions_opened += instance.sessions_opened;
            match instance.status {
                InstanceStatus::Healthy => stats.healthy_instances += 1,
                InstanceStatus::Busy => stats.busy_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowserPoolStats {
    pub launched_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub sessions_opened: usize,
}

/// Sessions backed by real Chrome instances.
///
/// The browser pool is created on the first session request and torn down by
/// [`SessionFactory::shutdown`], so a pool restart launches fresh browsers.
pub struct ChromeSessionFactory {
    config: Config,
    pool: Mutex<Option<Arc<BrowserPool>>>,
}

impl ChromeSessionFactory {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    async fn browser_pool(&self) -> Arc<BrowserPool> {
        let mut pool = self.pool.lock().await;
        pool.get_or_insert_with(|| Arc::new(BrowserPool::new(self.config.clone())))
            .clone()
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open_session(
        &self,
        worker_id: usize,
    ) -> Result<Box<dyn DocumentNavigator>, CaptureError> {
        let pool = self.browser_pool().await;
        let page = pool.new_page(worker_id).await?;
        let navigator = ChromeNavigator::new(page, &self.config).await?;
        Ok(Box::new(navigator))
    }

    async fn discard_session(&self, worker_id: usize) {
        let pool = self.pool.lock().await.clone();
        if let Some(pool) = pool {
            pool.restart_instance(worker_id).await;
        }
    }

    async fn shutdown(&self) {
        let pool = self.pool.lock().await.take();
        match pool {
            Some(pool) => {
                let stats = pool.get_stats().await;
                info!(
                    "Closing {} browsers ({} sessions opened, {} awaiting relaunch)",
                    stats.launched_instances, stats.sessions_opened, stats.failed_instances
                );
                pool.shutdown().await;
            }
            None => debug!("No browsers were launched"),
        }
    }
}

impl Drop for ChromeSessionFactory {
    fn drop(&mut self) {
        if let Ok(pool) = self.pool.try_lock() {
            if pool.is_some() {
                error!("Chrome session factory dropped while browsers are still running");
            }
        }
    }
}
