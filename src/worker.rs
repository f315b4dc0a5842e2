//! Bounded worker pool over browser sessions
//!
//! [`ClusterManager`] owns a FIFO queue of [`Task`]s and `concurrency_limit`
//! workers. Each worker holds at most one browser session, opened lazily and
//! reused across tasks until a session failure forces a fresh one.

use crate::{
    cancellable, AssetFetcher, CaptureError, ChromeSessionFactory, Config, DocumentNavigator,
    DocumentProcessor, DocumentReport, DocumentStatus, EventContext, EventKind, Metrics,
    OutcomeReporter, StructuredEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One submitted document URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: Uuid,
    pub url: String,
    pub submitted_at: DateTime<Utc>,
    /// Times this task was re-queued after a session failure.
    pub attempts: usize,
}

impl Task {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            submitted_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Source of browser sessions for pool workers.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self, worker_id: usize) -> Result<Box<dyn DocumentNavigator>, CaptureError>;

    /// Called after a session failure, before the worker opens a new session.
    async fn discard_session(&self, _worker_id: usize) {}

    /// Release every browser resource. Called once per pool stop.
    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish in-flight and queued tasks, then stop.
    Graceful,
    /// Cancel in-flight tasks and discard the queue.
    Immediate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub running: bool,
    pub concurrency_limit: usize,
    pub active: usize,
    pub queued: usize,
    pub peak_active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// A task currently held by a worker.
#[derive(Debug, Clone)]
pub struct InFlightTask {
    pub task_id: Uuid,
    pub url: String,
    pub worker_id: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum TaskOutcome {
    Finished,
    Failed,
    Cancelled,
}

#[derive(Debug, Default)]
struct DispatchState {
    queue: VecDeque<Task>,
    active: usize,
    peak_active: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
    draining: bool,
}

/// Queue and counters shared by the workers of one pool run.
///
/// `active` never exceeds `limit`: a task is claimed and counted under the
/// same lock.
struct Dispatcher {
    limit: usize,
    state: Mutex<DispatchState>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Dispatcher {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(DispatchState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, task: Task) -> Result<(), CaptureError> {
        {
            let mut state = self.lock();
            if state.draining || self.cancel.is_cancelled() {
                return Err(CaptureError::PoolNotRunning);
            }
            state.queue.push_back(task);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next task. `None` once the pool is cancelled, or once it
    /// is draining and the queue is empty.
    async fn next_task(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            if self.cancel.is_cancelled() {
                return None;
            }

            {
                let mut state = self.lock();
                if state.active < self.limit {
                    if let Some(task) = state.queue.pop_front() {
                        state.active += 1;
                        state.peak_active = state.peak_active.max(state.active);
                        return Some(task);
                    }
                }
                if state.draining && state.queue.is_empty() {
                    return None;
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    fn finish(&self, outcome: TaskOutcome) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            match outcome {
                TaskOutcome::Finished => state.completed += 1,
                TaskOutcome::Failed => state.failed += 1,
                TaskOutcome::Cancelled => state.cancelled += 1,
            }
        }
        self.notify.notify_waiters();
    }

    /// Release the worker slot and put `task` back at the tail.
    fn requeue(&self, task: Task) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.queue.push_back(task);
        }
        self.notify.notify_waiters();
    }

    async fn idle(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.lock();
                if state.active == 0 && state.queue.is_empty() {
                    return;
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    fn begin_drain(&self) {
        self.lock().draining = true;
        self.notify.notify_waiters();
    }

    /// Cancel in-flight work and return the tasks that never started.
    fn abort(&self) -> Vec<Task> {
        self.cancel.cancel();
        let mut state = self.lock();
        let discarded: Vec<Task> = state.queue.drain(..).collect();
        state.cancelled += discarded.len();
        discarded
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            running: true,
            concurrency_limit: self.limit,
            active: state.active,
            queued: state.queue.len(),
            peak_active: state.peak_active,
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
        }
    }
}

struct CaptureWorker {
    id: usize,
    dispatcher: Arc<Dispatcher>,
    factory: Arc<dyn SessionFactory>,
    processor: DocumentProcessor,
    reporter: OutcomeReporter,
    metrics: Arc<Metrics>,
    in_flight: Arc<DashMap<Uuid, InFlightTask>>,
    task_retry_limit: usize,
}

impl CaptureWorker {
    async fn run(self) {
        info!("Starting capture worker {}", self.id);
        let mut session: Option<Box<dyn DocumentNavigator>> = None;

        while let Some(task) = self.dispatcher.next_task().await {
            debug!("Worker {} claimed {} ({})", self.id, task.url, task.id);
            self.in_flight.insert(
                task.id,
                InFlightTask {
                    task_id: task.id,
                    url: task.url.clone(),
                    worker_id: self.id,
                    started_at: Utc::now(),
                },
            );
            self.metrics.document_started();
            let started = Instant::now();

            let result = self.process(&mut session, &task).await;

            self.metrics.document_finished();
            self.in_flight.remove(&task.id);
            self.settle(task, result, started.elapsed(), &mut session).await;
        }

        if let Some(nav) = session.take() {
            nav.close().await;
        }
        info!("Capture worker {} stopped", self.id);
    }

    async fn process(
        &self,
        session: &mut Option<Box<dyn DocumentNavigator>>,
        task: &Task,
    ) -> Result<DocumentReport, CaptureError> {
        let cancel = &self.dispatcher.cancel;
        if session.is_none() {
            let opened = cancellable(cancel, self.factory.open_session(self.id)).await?;
            *session = Some(opened);
        }
        let Some(nav) = session.as_deref() else {
            return Err(CaptureError::SessionFailure("no browser session".to_string()));
        };

        self.processor.process(task, nav, cancel).await
    }

    async fn settle(
        &self,
        mut task: Task,
        result: Result<DocumentReport, CaptureError>,
        elapsed: Duration,
        session: &mut Option<Box<dyn DocumentNavigator>>,
    ) {
        let err = match result {
            Ok(report) => {
                self.metrics.record_document(report.status, elapsed);
                self.dispatcher.finish(TaskOutcome::Finished);
                return;
            }
            Err(CaptureError::Cancelled) => {
                self.reporter.info(
                    EventKind::TaskCancelled,
                    format!("Cancelled {}", task.url),
                    EventContext::new()
                        .url(&task.url)
                        .with("task", task.id)
                        .with("worker", self.id),
                );
                self.dispatcher.finish(TaskOutcome::Cancelled);
                return;
            }
            Err(e) => e,
        };

        if err.is_retryable() {
            self.recycle_session(session).await;

            if task.attempts < self.task_retry_limit && !self.dispatcher.cancel.is_cancelled() {
                task.attempts += 1;
                self.metrics.record_task_retry();
                self.reporter.warn(
                    EventKind::TaskRetried,
                    format!(
                        "Encountered an error while crawling {}. {} This job will be retried",
                        task.url, err
                    ),
                    EventContext::new()
                        .url(&task.url)
                        .with("task", task.id)
                        .with("attempt", task.attempts)
                        .stack(&err),
                );
                self.dispatcher.requeue(task);
                return;
            }
        }

        self.metrics.record_document(DocumentStatus::Failed, elapsed);
        self.reporter.error(
            EventKind::TaskFailed,
            format!("Failed to crawl {}: {}", task.url, err),
            EventContext::new()
                .url(&task.url)
                .with("task", task.id)
                .with("attempts", task.attempts + 1)
                .with("severity", format!("{:?}", err.severity()).to_lowercase())
                .stack(&err),
        );
        self.dispatcher.finish(TaskOutcome::Failed);
    }

    async fn recycle_session(&self, session: &mut Option<Box<dyn DocumentNavigator>>) {
        warn!("Worker {} discarding its browser session", self.id);
        if let Some(nav) = session.take() {
            nav.close().await;
        }
        self.factory.discard_session(self.id).await;
    }
}

struct RunningPool {
    dispatcher: Arc<Dispatcher>,
    workers: Vec<JoinHandle<()>>,
}

/// Accepts document URLs and runs them on a bounded set of browser sessions.
pub struct ClusterManager {
    config: Config,
    factory: Arc<dyn SessionFactory>,
    reporter: OutcomeReporter,
    metrics: Arc<Metrics>,
    assets: AssetFetcher,
    in_flight: Arc<DashMap<Uuid, InFlightTask>>,
    // Read by the synchronous submit path.
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    lifecycle: tokio::sync::Mutex<Option<RunningPool>>,
}

impl ClusterManager {
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>) -> Result<Self, CaptureError> {
        config.validate()?;
        let reporter = OutcomeReporter::new(config.event_buffer);
        let assets = AssetFetcher::new(reporter.clone(), config.background_timeout)?;

        Ok(Self {
            config,
            factory,
            reporter,
            metrics: Arc::new(Metrics::new()),
            assets,
            in_flight: Arc::new(DashMap::new()),
            dispatcher: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        })
    }

    /// Pool backed by locally launched Chrome instances.
    pub fn with_chrome(config: Config) -> Result<Self, CaptureError> {
        let factory = Arc::new(ChromeSessionFactory::new(config.clone()));
        Self::new(config, factory)
    }

    /// Start the workers. Calling it on a running pool has no effect.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!("Cluster already running");
            return Ok(());
        }

        let limit = self.config.concurrency_limit;
        let dispatcher = Arc::new(Dispatcher::new(limit));
        let processor = DocumentProcessor::new(
            &self.config,
            self.assets.clone(),
            self.reporter.clone(),
            self.metrics.clone(),
        );

        let workers = (0..limit)
            .map(|id| {
                let worker = CaptureWorker {
                    id,
                    dispatcher: dispatcher.clone(),
                    factory: self.factory.clone(),
                    processor: processor.clone(),
                    reporter: self.reporter.clone(),
                    metrics: self.metrics.clone(),
                    in_flight: self.in_flight.clone(),
                    task_retry_limit: self.config.task_retry_limit,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        *self.dispatcher_slot_mut() = Some(dispatcher.clone());
        *lifecycle = Some(RunningPool { dispatcher, workers });

        self.reporter.info(
            EventKind::PoolStarted,
            format!("Cluster started with {} workers", limit),
            EventContext::new().with("concurrency", limit),
        );
        Ok(())
    }

    /// Queue `url` for capture. Never waits for the document to run.
    pub fn submit(&self, url: &str) -> Result<Uuid, CaptureError> {
        let dispatcher = self.dispatcher_slot().clone().ok_or(CaptureError::PoolNotRunning)?;

        let task = Task::new(url);
        let id = task.id;
        dispatcher.enqueue(task)?;

        self.reporter.info(
            EventKind::TaskSubmitted,
            format!("Queued {}", url),
            EventContext::new().url(url).with("task", id),
        );
        Ok(id)
    }

    /// Stop the pool and release every browser. A stopped pool can be started
    /// again; stopping a pool that is not running does nothing.
    ///
    /// New submissions are rejected as soon as the stop begins. The pool
    /// reports not-running once every worker has exited.
    pub async fn stop(&self, mode: StopMode) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(pool) = lifecycle.take() else {
            debug!("Cluster not running");
            return;
        };

        info!("Stopping cluster ({:?})", mode);
        let mut workers = pool.workers;
        match mode {
            StopMode::Graceful => {
                pool.dispatcher.begin_drain();
                for joined in join_all(workers.iter_mut()).await {
                    if let Err(e) = joined {
                        error!("Capture worker ended abnormally: {}", e);
                    }
                }
            }
            StopMode::Immediate => {
                self.discard_queued(&pool.dispatcher);
                let grace = self.config.stop_grace;
                if timeout(grace, join_all(workers.iter_mut())).await.is_err() {
                    warn!("Workers still busy after {:?}, aborting them", grace);
                    for worker in &workers {
                        worker.abort();
                    }
                    self.in_flight.clear();
                }
            }
        }

        self.factory.shutdown().await;
        *self.dispatcher_slot_mut() = None;

        let stats = pool.dispatcher.stats();
        self.reporter.info(
            EventKind::PoolStopped,
            "Cluster stopped",
            EventContext::new()
                .with("mode", format!("{:?}", mode).to_lowercase())
                .with("completed", stats.completed)
                .with("failed", stats.failed)
                .with("cancelled", stats.cancelled),
        );
    }

    /// Cancel in-flight documents and discard the queue without waiting.
    ///
    /// Workers exit once their current step returns; a following
    /// [`ClusterManager::stop`] then completes promptly in either mode.
    pub fn cancel_all(&self) {
        let dispatcher = self.dispatcher_slot().clone();
        if let Some(dispatcher) = dispatcher {
            self.discard_queued(&dispatcher);
        }
    }

    fn discard_queued(&self, dispatcher: &Dispatcher) {
        for task in dispatcher.abort() {
            self.reporter.info(
                EventKind::TaskCancelled,
                format!("Discarded queued {}", task.url),
                EventContext::new().url(&task.url).with("task", task.id),
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        match self.dispatcher_slot().as_ref() {
            Some(dispatcher) => dispatcher.stats(),
            None => PoolStats {
                concurrency_limit: self.config.concurrency_limit,
                ..Default::default()
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher_slot().is_some()
    }

    /// Wait until every queued and in-flight task has resolved.
    pub async fn wait_idle(&self) {
        let Some(dispatcher) = self.dispatcher_slot().clone() else {
            return;
        };
        dispatcher.idle().await;
    }

    /// Receive every structured event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StructuredEvent> {
        self.reporter.subscribe()
    }

    pub fn reporter(&self) -> &OutcomeReporter {
        &self.reporter
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn in_flight(&self) -> Vec<InFlightTask> {
        let mut tasks: Vec<InFlightTask> =
            self.in_flight.iter().map(|entry| entry.value().clone()).collect();
        tasks.sort_by_key(|task| task.started_at);
        tasks
    }

    fn dispatcher_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<Dispatcher>>> {
        self.dispatcher.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatcher_slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Dispatcher>>> {
        self.dispatcher.write().unwrap_or_else(PoisonError::into_inner)
    }
}
