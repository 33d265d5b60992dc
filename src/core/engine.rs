//! The work queue engine - one FIFO drained by one engine task.
//!
//! A [`WorkQueue`] owns its items, its flags and at most one live engine
//! task. Producers push from any task; the engine parks on a wake signal,
//! drains the FIFO in order and hands every item to the dispatcher:
//! - **Start/Stop**: cooperative. Every engine launch gets a generation and
//!   exits at its next check once the generation is stale or the queue stops
//! - **Pause/Resume**: pausing stops the engine between items, resuming
//!   wakes it if anything is pending
//! - **Reclaim**: a reclaiming queue stops its engine when drained and starts
//!   a fresh one on the next enqueue

use crate::config::{DispatchMode, WorkQueueConfig};
use crate::core::signal::WakeSignal;
use crate::core::worker::{Dispatcher, FailureSink, SharedAction, Verdict};
use crate::error::{AnvilError, AnvilResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueStats {
    /// Queue name
    pub name: String,
    /// Items waiting to be dispatched
    pub length: usize,
    /// Dispatches currently holding a slot
    pub worker_count: usize,
    /// Whether an engine is running
    pub running: bool,
    /// Whether dispatching is paused
    pub paused: bool,
    /// Actions that returned `Ok`
    pub completed: u64,
    /// Actions that returned an error or panicked
    pub failed: u64,
}

/// Single-key FIFO dispatcher with its own engine task.
///
/// # Examples
///
/// ```rust
/// use anvilq::prelude::*;
///
/// # async fn example() -> AnvilResult<()> {
/// let queue = WorkQueue::builder(
///     "thumbnails",
///     action_fn(|path: String| async move {
///         tracing::info!("rendering {}", path);
///         Ok(())
///     }),
/// )
/// .reclaim(true)
/// .build()?;
///
/// // Reclaiming queues start on first use.
/// queue.enqueue("cat.png".to_string()).await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkQueue<T: Send + 'static> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T: Send + 'static> {
    name: String,
    reclaim: bool,
    config: WorkQueueConfig,
    /// FIFO; flag writes happen while this lock is held
    items: Mutex<VecDeque<T>>,
    running: AtomicBool,
    paused: AtomicBool,
    disposed: AtomicBool,
    generation: AtomicU64,
    wake: WakeSignal,
    dispatcher: Dispatcher<T>,
    /// Serialises engine launch and retirement
    engine: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Why an item was not pushed.
enum Rejected {
    Stopped,
    Disposed,
}

/// Builder for [`WorkQueue`].
pub struct WorkQueueBuilder<T: Send + 'static> {
    name: String,
    action: SharedAction<T>,
    config: WorkQueueConfig,
    failure_sink: Option<FailureSink>,
}

impl<T: Send + 'static> WorkQueueBuilder<T> {
    /// Enable or disable reclaim.
    pub fn reclaim(mut self, reclaim: bool) -> Self {
        self.config.reclaim = reclaim;
        self
    }

    /// Set the dispatch mode.
    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.config.dispatch_mode = mode;
        self
    }

    /// Set the maximum number of concurrent dispatches.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    /// Set the concurrency ceiling `max_concurrency` is clamped to.
    pub fn concurrency_ceiling(mut self, ceiling: usize) -> Self {
        self.config.concurrency_ceiling = ceiling;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkQueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Report failed dispatches to this sink.
    pub fn failure_sink(mut self, sink: FailureSink) -> Self {
        self.failure_sink = Some(sink);
        self
    }

    /// Validate the settings and create the queue (stopped).
    pub fn build(self) -> AnvilResult<WorkQueue<T>> {
        WorkQueue::with_config(self.name, self.action, self.config, self.failure_sink)
    }
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Create a stopped, non-reclaiming, inline queue with default settings.
    pub fn new(name: impl Into<String>, action: SharedAction<T>) -> AnvilResult<Self> {
        Self::with_config(name, action, WorkQueueConfig::default(), None)
    }

    /// Start building a queue.
    pub fn builder(name: impl Into<String>, action: SharedAction<T>) -> WorkQueueBuilder<T> {
        WorkQueueBuilder {
            name: name.into(),
            action,
            config: WorkQueueConfig::default(),
            failure_sink: None,
        }
    }

    /// Create a stopped queue from a configuration.
    pub fn with_config(
        name: impl Into<String>,
        action: SharedAction<T>,
        config: WorkQueueConfig,
        failure_sink: Option<FailureSink>,
    ) -> AnvilResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AnvilError::config("Work queue name must not be empty"));
        }
        config
            .validate()
            .map_err(|errors| AnvilError::config(errors.join("; ")))?;

        let concurrency = config.effective_concurrency();
        if concurrency < config.max_concurrency {
            tracing::debug!(
                "🔨 Queue {} concurrency {} clamped to ceiling {}",
                name,
                config.max_concurrency,
                concurrency
            );
        }

        let dispatcher = Dispatcher::new(
            &name,
            action,
            config.dispatch_mode,
            concurrency,
            failure_sink,
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                name,
                reclaim: config.reclaim,
                config,
                items: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                wake: WakeSignal::new(),
                dispatcher,
                engine: AsyncMutex::new(None),
            }),
        })
    }

    /// Start the engine. Does nothing if it is already running.
    ///
    /// A previous engine that is still winding down is waited for (up to the
    /// configured retire timeout) before the new one is launched. Items left
    /// queued by `stop` are dispatched by the new engine unless paused.
    pub async fn start(&self) -> AnvilResult<()> {
        let inner = &self.inner;
        let mut engine = inner.engine.lock().await;

        {
            let _items = inner.lock_items();
            if inner.disposed.load(Ordering::Acquire) {
                return Err(AnvilError::disposed(&inner.name));
            }
            if inner.running.load(Ordering::Acquire) {
                return Ok(());
            }
        }

        if let Some(previous) = engine.take() {
            inner.retire_or_abandon(previous).await;
        }

        let generation = {
            let items = inner.lock_items();
            if inner.disposed.load(Ordering::Acquire) {
                return Err(AnvilError::disposed(&inner.name));
            }
            inner.wake.clear();
            // Items left behind by a stop or a halt are picked up right away.
            if !items.is_empty() && !inner.paused.load(Ordering::Acquire) {
                inner.wake.raise();
            }
            let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            inner.running.store(true, Ordering::Release);
            generation
        };

        *engine = Some(tokio::spawn(QueueInner::run(Arc::clone(inner), generation)));
        Ok(())
    }

    /// Stop the engine after the item it is currently dispatching.
    ///
    /// Pending items stay queued for a later `start`. In-flight dispatches
    /// are not cancelled.
    pub fn stop(&self) {
        if self.inner.halt() {
            tracing::debug!("🔨 Queue {} stopping", self.inner.name);
        }
    }

    /// Add an item to the back of the queue.
    ///
    /// A stopped queue starts itself when reclaim is enabled and rejects the
    /// item with [`AnvilError::NotRunning`] otherwise.
    pub async fn enqueue(&self, item: T) -> AnvilResult<()> {
        self.offer(item).await.map_err(|(_, e)| e)
    }

    /// Like `enqueue`, but hands the item back when it is rejected.
    pub(crate) async fn offer(&self, item: T) -> Result<(), (T, AnvilError)> {
        let mut item = item;
        loop {
            match self.inner.try_push(item) {
                Ok(()) => return Ok(()),
                Err((returned, Rejected::Disposed)) => {
                    return Err((returned, AnvilError::disposed(&self.inner.name)));
                }
                Err((returned, Rejected::Stopped)) if !self.inner.reclaim => {
                    return Err((returned, AnvilError::not_running(&self.inner.name)));
                }
                Err((returned, Rejected::Stopped)) => {
                    item = returned;
                    if let Err(e) = self.start().await {
                        return Err((item, e));
                    }
                }
            }
        }
    }

    /// Stop dispatching between items. An item already dispatched completes.
    pub fn pause(&self) {
        let _items = self.inner.lock_items();
        self.inner.paused.store(true, Ordering::Release);
        self.inner.wake.clear();
    }

    /// Resume dispatching, waking the engine if items are pending.
    pub fn resume(&self) {
        let items = self.inner.lock_items();
        self.inner.paused.store(false, Ordering::Release);
        if !items.is_empty() {
            self.inner.wake.raise();
        }
    }

    /// Stop the engine, refuse further work and wait for the engine to exit.
    pub async fn dispose(&self) {
        let mut engine = self.inner.engine.lock().await;
        {
            let _items = self.inner.lock_items();
            if self.inner.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.inner.retire_flags();
        }
        self.inner.dispatcher.close();

        if let Some(previous) = engine.take() {
            self.inner.retire_or_abandon(previous).await;
        }
        tracing::debug!("🔨 Queue {} disposed", self.inner.name);
    }

    /// Dispose the queue if it is stopped and empty, in one step.
    ///
    /// Returns whether the queue was disposed. An enqueue racing with this
    /// call either lands before (and the queue is kept) or fails with
    /// [`AnvilError::Disposed`].
    pub async fn retire_if_idle(&self) -> bool {
        let mut engine = self.inner.engine.lock().await;
        {
            let items = self.inner.lock_items();
            if self.inner.disposed.load(Ordering::Acquire)
                || self.inner.running.load(Ordering::Acquire)
                || !items.is_empty()
            {
                return false;
            }
            self.inner.disposed.store(true, Ordering::Release);
            self.inner.retire_flags();
        }
        self.inner.dispatcher.close();

        if let Some(previous) = engine.take() {
            self.inner.retire_or_abandon(previous).await;
        }
        true
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of items waiting to be dispatched.
    pub fn len(&self) -> usize {
        self.inner.lock_items().len()
    }

    /// Whether no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dispatches currently holding a slot.
    pub fn worker_count(&self) -> usize {
        self.inner.dispatcher.live()
    }

    /// Whether an engine is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether dispatching is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Whether the queue has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Snapshot of the queue state and counters.
    pub fn stats(&self) -> WorkQueueStats {
        let counters = self.inner.dispatcher.counters();
        WorkQueueStats {
            name: self.inner.name.clone(),
            length: self.len(),
            worker_count: self.worker_count(),
            running: self.is_running(),
            paused: self.is_paused(),
            completed: counters.completed(),
            failed: counters.failed(),
        }
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        // The engine holds its own reference; let it exit instead of parking forever.
        self.inner.halt();
        self.inner.dispatcher.close();
    }
}

impl<T: Send + 'static> QueueInner<T> {
    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire)
            && self.generation.load(Ordering::Acquire) == generation
    }

    /// Mark the current engine stale and wake it. Caller holds the items lock.
    fn retire_flags(&self) {
        self.running.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.wake.raise();
    }

    /// Stop without waiting. Returns whether the queue was running.
    fn halt(&self) -> bool {
        let _items = self.lock_items();
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.retire_flags();
        true
    }

    fn try_push(&self, item: T) -> Result<(), (T, Rejected)> {
        let mut items = self.lock_items();
        if self.disposed.load(Ordering::Acquire) {
            return Err((item, Rejected::Disposed));
        }
        if !self.running.load(Ordering::Acquire) {
            return Err((item, Rejected::Stopped));
        }

        items.push_back(item);
        if !self.paused.load(Ordering::Acquire) {
            self.wake.raise();
        }
        Ok(())
    }

    /// Wait, bounded, for a previous engine to exit.
    ///
    /// Fails with [`AnvilError::Timeout`] when the engine is still busy after
    /// the retire timeout. A stale engine never pops again, so it is safe to
    /// leave it running.
    async fn retire(&self, previous: JoinHandle<()>) -> AnvilResult<()> {
        if previous.is_finished() {
            return Ok(());
        }

        self.wake.raise();
        let limit = self.config.retire_timeout();
        match timeout(limit, previous).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("🔨 Queue {} engine ended abnormally: {}", self.name, e);
            }
            Err(_) => {
                return Err(AnvilError::Timeout {
                    timeout_ms: self.config.retire_timeout_ms,
                });
            }
        }
        Ok(())
    }

    async fn retire_or_abandon(&self, previous: JoinHandle<()>) {
        if let Err(e) = self.retire(previous).await {
            tracing::warn!("🔨 Queue {} abandoning previous engine: {}", self.name, e);
        }
    }

    async fn run(inner: Arc<Self>, generation: u64) {
        tracing::debug!("🔨 Queue {} engine {} started", inner.name, generation);

        while inner.is_current(generation) {
            inner.wake.wait().await;
            if !inner.is_current(generation) {
                break;
            }
            if !inner.drain(generation).await {
                break;
            }
        }

        tracing::debug!("🔨 Queue {} engine {} retired", inner.name, generation);
    }

    /// Dispatch items until the FIFO is empty, the queue pauses or the engine
    /// goes stale. Returns `false` when the engine must exit.
    async fn drain(&self, generation: u64) -> bool {
        loop {
            let item = {
                let mut items = self.lock_items();
                if !self.is_current(generation) {
                    return false;
                }
                if self.paused.load(Ordering::Acquire) {
                    return true;
                }
                match items.pop_front() {
                    Some(item) => item,
                    None => {
                        if self.reclaim {
                            self.running.store(false, Ordering::Release);
                            self.wake.clear();
                            tracing::debug!("🔨 Queue {} drained, reclaiming engine", self.name);
                            return false;
                        }
                        return true;
                    }
                }
            };

            let Some(slot) = self.dispatcher.acquire().await else {
                tracing::debug!("🔨 Queue {} limiter closed, engine exiting", self.name);
                return false;
            };

            if !self.is_current(generation) {
                // Stopped while waiting for a slot; keep the item for the next engine.
                drop(slot);
                self.lock_items().push_front(item);
                return false;
            }

            if self.dispatcher.dispatch(item, slot).await == Verdict::Halt {
                let _items = self.lock_items();
                if self.is_current(generation) {
                    self.running.store(false, Ordering::Release);
                }
                tracing::error!(
                    "🔨 Queue {} engine halted after a panicking action",
                    self.name
                );
                return false;
            }
        }
    }
}
