//! Dispatch side of a work queue.
//!
//! The engine hands every dequeued item to a [`Dispatcher`], which holds one
//! dispatch slot for the lifetime of the action call and runs the action in
//! the queue's [`DispatchMode`]. Outcomes are counted, logged and, when a
//! failure sink is attached, reported as [`DispatchFailure`]s.

use crate::config::DispatchMode;
use crate::error::AnvilResult;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

/// Unit of work applied to every item of a queue.
///
/// # Examples
///
/// ```rust
/// use anvilq::prelude::*;
///
/// struct Mailer;
///
/// #[async_trait]
/// impl WorkAction<String> for Mailer {
///     async fn perform(&self, to: String) -> AnvilResult<()> {
///         tracing::info!("sending mail to {}", to);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait WorkAction<T: Send + 'static>: Send + Sync + 'static {
    /// Process one item.
    async fn perform(&self, item: T) -> AnvilResult<()>;
}

/// Shared handle to an action.
pub type SharedAction<T> = Arc<dyn WorkAction<T>>;

/// Adapter turning an async closure into a [`WorkAction`].
pub struct FnAction<F>(F);

#[async_trait]
impl<T, F, Fut> WorkAction<T> for FnAction<F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AnvilResult<()>> + Send + 'static,
{
    async fn perform(&self, item: T) -> AnvilResult<()> {
        (self.0)(item).await
    }
}

/// Wrap an async closure as a shared action.
pub fn action_fn<T, F, Fut>(f: F) -> SharedAction<T>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AnvilResult<()>> + Send + 'static,
{
    Arc::new(FnAction(f))
}

/// How a dispatch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The action returned an error
    Error(String),
    /// The action panicked
    Panic(String),
}

/// A failed dispatch, reported through a queue's failure sink.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    /// Name of the queue that dispatched the item
    pub queue: String,
    /// What went wrong
    pub kind: FailureKind,
}

/// Sender half of a failure sink.
pub type FailureSink = mpsc::UnboundedSender<DispatchFailure>;

/// What the engine should do after handing an item over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Keep draining
    Continue,
    /// An inline action panicked; the engine must halt
    Halt,
}

/// One unit of a queue's concurrency ceiling.
///
/// Dropping the slot returns the permit and decrements the live count, so
/// release happens however the action ends.
pub(crate) struct DispatchSlot {
    _permit: OwnedSemaphorePermit,
    live: Arc<AtomicUsize>,
}

impl Drop for DispatchSlot {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Completion counters of a queue.
#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

impl DispatchCounters {
    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Shared reporting state, cloned into every spawned dispatch.
#[derive(Clone)]
struct Reporter {
    queue: Arc<str>,
    counters: Arc<DispatchCounters>,
    failure_sink: Option<FailureSink>,
}

impl Reporter {
    fn record(&self, outcome: Result<(), FailureKind>) {
        match outcome {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(kind) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                match &kind {
                    FailureKind::Error(message) => {
                        tracing::error!("🔨 Queue {} action failed: {}", self.queue, message)
                    }
                    FailureKind::Panic(message) => {
                        tracing::error!("🔨 Queue {} action panicked: {}", self.queue, message)
                    }
                }

                if let Some(sink) = &self.failure_sink {
                    let failure = DispatchFailure {
                        queue: self.queue.to_string(),
                        kind,
                    };
                    if sink.send(failure).is_err() {
                        tracing::debug!("🔨 Queue {} failure sink closed", self.queue);
                    }
                }
            }
        }
    }
}

/// Runs the action for dequeued items under the queue's concurrency limit.
pub(crate) struct Dispatcher<T: Send + 'static> {
    action: SharedAction<T>,
    mode: DispatchMode,
    limiter: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    reporter: Reporter,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub(crate) fn new(
        queue: &str,
        action: SharedAction<T>,
        mode: DispatchMode,
        max_concurrency: usize,
        failure_sink: Option<FailureSink>,
    ) -> Self {
        Self {
            action,
            mode,
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            live: Arc::new(AtomicUsize::new(0)),
            reporter: Reporter {
                queue: Arc::from(queue),
                counters: Arc::new(DispatchCounters::default()),
                failure_sink,
            },
        }
    }

    /// Number of dispatches currently holding a slot.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn counters(&self) -> &DispatchCounters {
        &self.reporter.counters
    }

    /// Wait for a free dispatch slot. `None` once the limiter is closed.
    pub(crate) async fn acquire(&self) -> Option<DispatchSlot> {
        let permit = Arc::clone(&self.limiter).acquire_owned().await.ok()?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(DispatchSlot {
            _permit: permit,
            live: Arc::clone(&self.live),
        })
    }

    /// Refuse further slots. Dispatches already holding one finish normally.
    pub(crate) fn close(&self) {
        self.limiter.close();
    }

    /// Hand one item to the action according to the dispatch mode.
    pub(crate) async fn dispatch(&self, item: T, slot: DispatchSlot) -> Verdict {
        let action = Arc::clone(&self.action);
        let reporter = self.reporter.clone();

        match self.mode {
            DispatchMode::Inline => {
                let outcome = run_action(action, item).await;
                drop(slot);
                let halt = matches!(outcome, Err(FailureKind::Panic(_)));
                reporter.record(outcome);
                if halt { Verdict::Halt } else { Verdict::Continue }
            }
            DispatchMode::Pooled => {
                tokio::spawn(async move {
                    let outcome = run_action(action, item).await;
                    drop(slot);
                    reporter.record(outcome);
                });
                Verdict::Continue
            }
            DispatchMode::Dedicated => {
                let handle = Handle::current();
                tokio::task::spawn_blocking(move || {
                    let outcome = handle.block_on(run_action(action, item));
                    drop(slot);
                    reporter.record(outcome);
                });
                Verdict::Continue
            }
        }
    }
}

async fn run_action<T: Send + 'static>(
    action: SharedAction<T>,
    item: T,
) -> Result<(), FailureKind> {
    match AssertUnwindSafe(action.perform(item)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(FailureKind::Error(error.to_string())),
        Err(payload) => Err(FailureKind::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
