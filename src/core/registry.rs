//! Keyed queue registry.
//!
//! A [`KeyedQueueRegistry`] maps keys to lazily created [`WorkQueue`]s that
//! share one action. Items for the same key are processed in order, one at a
//! time; different keys proceed independently.
//!
//! # Overview
//!
//! - Per-key queues reclaim: their engine stops once drained and starts
//!   again on the next item for that key
//! - Pausing the registry pauses every member, and members created while
//!   paused start paused
//! - A background recycler periodically drops members that are stopped and
//!   empty, so the key space does not grow without bound
//!
//! # Examples
//!
//! ```rust
//! use anvilq::prelude::*;
//!
//! # async fn example() -> AnvilResult<()> {
//! let registry = KeyedQueueRegistry::new(
//!     "orders",
//!     action_fn(|order_id: u64| async move {
//!         tracing::info!("settling order {}", order_id);
//!         Ok(())
//!     }),
//! )?;
//!
//! registry.enqueue("alice".to_string(), 1).await?;
//! registry.enqueue("bob".to_string(), 2).await?;
//!
//! let metrics = registry.metrics().await;
//! assert_eq!(metrics.member_count, 2);
//!
//! registry.dispose().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{DurationExt, RegistryConfig};
use crate::core::engine::WorkQueue;
use crate::core::worker::{FailureSink, SharedAction};
use crate::error::{AnvilError, AnvilResult};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Aggregated view of a registry's members.
///
/// Best-effort: members may change while the snapshot is taken, but every
/// figure about the active subset comes from one reading per member.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryMetrics {
    /// Number of mapped keys
    pub member_count: usize,
    /// Number of members whose engine is running
    pub active_member_count: usize,
    /// Mean pending length over running members
    pub active_member_queue_average_length: f64,
    /// Longest pending length over running members
    pub active_member_queue_max_length: usize,
    /// Sum of pending lengths over running members
    pub active_member_queue_total_length: usize,
    /// Dispatches in flight across all members
    pub total_worker_count: usize,
}

impl fmt::Display for RegistryMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "members: {} (active {}) | queued: total {} max {} avg {:.2} | workers: {}",
            self.member_count,
            self.active_member_count,
            self.active_member_queue_total_length,
            self.active_member_queue_max_length,
            self.active_member_queue_average_length,
            self.total_worker_count
        )
    }
}

/// Registry of per-key work queues sharing one action.
///
/// Must be created inside a Tokio runtime: construction spawns the recycler.
pub struct KeyedQueueRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
{
    inner: Arc<RegistryInner<K, T>>,
    recycler: JoinHandle<()>,
}

struct RegistryInner<K, T: Send + 'static> {
    name: String,
    action: SharedAction<T>,
    config: RegistryConfig,
    failure_sink: Option<FailureSink>,
    members: RwLock<HashMap<K, Arc<WorkQueue<T>>>>,
    paused: AtomicBool,
    disposed: AtomicBool,
}

impl<K, T> KeyedQueueRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Create a registry with the default configuration.
    pub fn new(name: impl Into<String>, action: SharedAction<T>) -> AnvilResult<Self> {
        Self::with_config(name, action, RegistryConfig::default(), None)
    }

    /// Create a registry from a configuration, optionally reporting failed
    /// dispatches of every member to `failure_sink`.
    pub fn with_config(
        name: impl Into<String>,
        action: SharedAction<T>,
        config: RegistryConfig,
        failure_sink: Option<FailureSink>,
    ) -> AnvilResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AnvilError::config("Registry name must not be empty"));
        }
        config
            .validate()
            .map_err(|errors| AnvilError::config(errors.join("; ")))?;

        let inner = Arc::new(RegistryInner {
            name,
            action,
            config,
            failure_sink,
            members: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        let recycler = spawn_recycler(&inner);

        tracing::info!(
            "🔨 Registry {} ready (recycle after {}s, every {}s)",
            inner.name,
            inner.config.recycle_warmup_secs,
            inner.config.recycle_interval_secs
        );
        Ok(Self { inner, recycler })
    }

    /// Route an item to the queue for `key`, creating the queue on first use.
    pub async fn enqueue(&self, key: K, item: T) -> AnvilResult<()> {
        let mut item = item;
        loop {
            let queue = self.inner.member_for(&key).await?;
            match queue.offer(item).await {
                Ok(()) => return Ok(()),
                Err((returned, e)) if e.is_disposed() => {
                    // Lost a race with recycling or removal; retry on a fresh member.
                    item = returned;
                    self.inner.forget(&key, &queue).await;
                }
                Err((_, e)) => return Err(e),
            }
        }
    }

    /// Remove and dispose the queue for `key`. Returns whether it existed.
    pub async fn remove(&self, key: &K) -> bool {
        let removed = self.inner.members.write().await.remove(key);
        match removed {
            Some(queue) => {
                queue.dispose().await;
                tracing::debug!("🔨 Registry {} removed member {}", self.inner.name, key);
                true
            }
            None => false,
        }
    }

    /// Pause every member; members created from now on start paused.
    pub async fn pause(&self) {
        let members = self.inner.members.write().await;
        self.inner.paused.store(true, Ordering::Release);
        for queue in members.values() {
            queue.pause();
        }
        tracing::info!("🔨 Registry {} paused", self.inner.name);
    }

    /// Resume every member.
    pub async fn resume(&self) {
        let members = self.inner.members.write().await;
        self.inner.paused.store(false, Ordering::Release);
        for queue in members.values() {
            queue.resume();
        }
        tracing::info!("🔨 Registry {} resumed", self.inner.name);
    }

    /// Run one recycle pass now. Returns the number of members removed.
    pub async fn recycle_now(&self) -> usize {
        self.inner.recycle().await
    }

    /// Snapshot of the member metrics.
    pub async fn metrics(&self) -> RegistryMetrics {
        let members = self.inner.members.read().await;
        let mut metrics = RegistryMetrics {
            member_count: members.len(),
            ..Default::default()
        };

        for queue in members.values() {
            metrics.total_worker_count += queue.worker_count();
            if queue.is_running() {
                let length = queue.len();
                metrics.active_member_count += 1;
                metrics.active_member_queue_total_length += length;
                metrics.active_member_queue_max_length =
                    metrics.active_member_queue_max_length.max(length);
            }
        }

        if metrics.active_member_count > 0 {
            metrics.active_member_queue_average_length = metrics.active_member_queue_total_length
                as f64
                / metrics.active_member_count as f64;
        }
        metrics
    }

    /// Keys currently mapped.
    pub async fn members(&self) -> Vec<K> {
        self.inner.members.read().await.keys().cloned().collect()
    }

    /// Number of mapped keys.
    pub async fn member_count(&self) -> usize {
        self.inner.members.read().await.len()
    }

    /// Whether `key` is mapped.
    pub async fn contains(&self, key: &K) -> bool {
        self.inner.members.read().await.contains_key(key)
    }

    /// The queue for `key`, if mapped.
    pub async fn get(&self, key: &K) -> Option<Arc<WorkQueue<T>>> {
        self.inner.members.read().await.get(key).cloned()
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the registry is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Stop the recycler and dispose every member.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.recycler.abort();

        let members = std::mem::take(&mut *self.inner.members.write().await);
        let count = members.len();
        for queue in members.into_values() {
            queue.dispose().await;
        }
        tracing::info!(
            "🔨 Registry {} disposed ({} members released)",
            self.inner.name,
            count
        );
    }
}

impl<K, T> Drop for KeyedQueueRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
{
    fn drop(&mut self) {
        self.recycler.abort();
    }
}

impl<K, T> RegistryInner<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
{
    async fn member_for(&self, key: &K) -> AnvilResult<Arc<WorkQueue<T>>> {
        if let Some(queue) = self.members.read().await.get(key) {
            return Ok(Arc::clone(queue));
        }

        let mut members = self.members.write().await;
        if self.disposed.load(Ordering::Acquire) {
            return Err(AnvilError::disposed(&self.name));
        }
        if let Some(queue) = members.get(key) {
            return Ok(Arc::clone(queue));
        }

        let queue = WorkQueue::with_config(
            format!("{}{}{}", self.name, self.config.key_separator, key),
            Arc::clone(&self.action),
            self.config.member_queue_config(),
            self.failure_sink.clone(),
        )?;
        if self.paused.load(Ordering::Acquire) {
            queue.pause();
        }

        let queue = Arc::new(queue);
        members.insert(key.clone(), Arc::clone(&queue));
        tracing::debug!("🔨 Registry {} created member {}", self.name, queue.name());
        Ok(queue)
    }

    /// Drop `key` if it still maps to `queue`.
    async fn forget(&self, key: &K, queue: &Arc<WorkQueue<T>>) {
        let mut members = self.members.write().await;
        if members
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, queue))
        {
            members.remove(key);
        }
    }

    async fn recycle(&self) -> usize {
        let mut members = self.members.write().await;
        let before = members.len();
        let idle: Vec<K> = members
            .iter()
            .filter(|(_, queue)| !queue.is_running() && queue.is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in idle {
            let Some(queue) = members.get(&key).cloned() else {
                continue;
            };
            if queue.retire_if_idle().await {
                members.remove(&key);
                removed += 1;
            }
        }

        tracing::debug!(
            "🔨 Registry {} recycle pass removed {} of {} members",
            self.name,
            removed,
            before
        );
        removed
    }
}

fn spawn_recycler<K, T>(inner: &Arc<RegistryInner<K, T>>) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Send + 'static,
{
    let weak: Weak<RegistryInner<K, T>> = Arc::downgrade(inner);
    let warmup = inner.config.recycle_warmup_secs.secs();
    let period = inner.config.recycle_interval_secs.secs();

    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + warmup, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.disposed.load(Ordering::Acquire) {
                break;
            }
            inner.recycle().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker::{FailureKind, action_fn};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{Semaphore, mpsc};

    async fn eventually<F, Fut>(what: &str, condition: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..300 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {}", what);
    }

    fn counting_registry() -> (KeyedQueueRegistry<String, u32>, Arc<AtomicUsize>) {
        let done = Arc::new(AtomicUsize::new(0));
        let action = {
            let done = Arc::clone(&done);
            action_fn(move |_: u32| {
                let done = Arc::clone(&done);
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        (KeyedQueueRegistry::new("R", action).unwrap(), done)
    }

    /// Item 0 waits for a gate permit; everything else passes straight through.
    fn gated_registry() -> (KeyedQueueRegistry<String, u32>, Arc<Semaphore>, Arc<AtomicUsize>) {
        let gate = Arc::new(Semaphore::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let action = {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            action_fn(move |item: u32| {
                let gate = Arc::clone(&gate);
                let done = Arc::clone(&done);
                async move {
                    if item == 0 {
                        gate.acquire().await.unwrap().forget();
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        (KeyedQueueRegistry::new("G", action).unwrap(), gate, done)
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    async fn sorted_members(registry: &KeyedQueueRegistry<String, u32>) -> Vec<String> {
        let mut members = registry.members().await;
        members.sort();
        members
    }

    #[tokio::test]
    async fn test_construction_validates() {
        let noop = action_fn(|_: u32| async { Ok(()) });
        assert!(KeyedQueueRegistry::<String, u32>::new("", Arc::clone(&noop)).is_err());

        let config = RegistryConfig::default().with_recycle(1, 0);
        assert!(KeyedQueueRegistry::<String, u32>::with_config("R", noop, config, None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_members_then_recycle() {
        let (registry, done) = counting_registry();

        for item in 1..=5 {
            registry.enqueue(key("alice"), item).await.unwrap();
        }
        registry.enqueue(key("bob"), 1).await.unwrap();

        assert_eq!(sorted_members(&registry).await, vec!["alice", "bob"]);
        assert_eq!(registry.member_count().await, 2);

        eventually("both drained", || async {
            done.load(Ordering::SeqCst) == 6 && registry.metrics().await.active_member_count == 0
        })
        .await;

        // First recycle pass fires after the one-minute warm-up.
        tokio::time::sleep(Duration::from_secs(61)).await;
        eventually("recycled", || async { registry.member_count().await == 0 }).await;
        assert!(registry.members().await.is_empty());

        registry.dispose().await;
    }

    #[tokio::test]
    async fn test_member_queues_reclaim_and_use_derived_names() {
        let (registry, done) = counting_registry();
        registry.enqueue(key("alice"), 1).await.unwrap();

        let queue = registry.get(&key("alice")).await.unwrap();
        assert_eq!(queue.name(), "R/alice");

        eventually("reclaimed", || async {
            done.load(Ordering::SeqCst) == 1 && !queue.is_running()
        })
        .await;

        // A reclaimed member restarts transparently.
        registry.enqueue(key("alice"), 2).await.unwrap();
        eventually("second item", || async { done.load(Ordering::SeqCst) == 2 }).await;
        assert_eq!(registry.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_per_key_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let action = {
            let seen = Arc::clone(&seen);
            action_fn(move |item: (char, u32)| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(item);
                    Ok(())
                }
            })
        };
        let registry = KeyedQueueRegistry::new("fifo", action).unwrap();

        for n in 0..50 {
            registry.enqueue(key("a"), ('a', n)).await.unwrap();
            registry.enqueue(key("b"), ('b', n)).await.unwrap();
        }

        eventually("all items", || async { seen.lock().unwrap().len() == 100 }).await;
        let seen = seen.lock().unwrap().clone();
        for lane in ['a', 'b'] {
            let order: Vec<u32> = seen
                .iter()
                .filter(|(k, _)| *k == lane)
                .map(|(_, n)| *n)
                .collect();
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_recycle_keeps_running_or_nonempty_members() {
        let (registry, gate, done) = gated_registry();

        registry.enqueue(key("busy"), 0).await.unwrap();
        registry.enqueue(key("busy"), 1).await.unwrap();
        registry.enqueue(key("idle"), 5).await.unwrap();

        eventually("idle drained", || async {
            done.load(Ordering::SeqCst) == 1
                && registry
                    .get(&key("idle"))
                    .await
                    .is_some_and(|queue| !queue.is_running())
        })
        .await;

        assert_eq!(registry.recycle_now().await, 1);
        assert_eq!(sorted_members(&registry).await, vec!["busy"]);

        let busy = registry.get(&key("busy")).await.unwrap();
        assert!(busy.is_running());
        assert_eq!(busy.len(), 1);

        gate.add_permits(1);
        eventually("busy drained", || async {
            done.load(Ordering::SeqCst) == 3 && !busy.is_running()
        })
        .await;

        assert_eq!(registry.recycle_now().await, 1);
        assert!(registry.members().await.is_empty());
        assert!(busy.is_disposed());

        // A recycled key comes back on the next item.
        registry.enqueue(key("busy"), 7).await.unwrap();
        eventually("recreated member ran", || async { done.load(Ordering::SeqCst) == 4 }).await;
        assert_eq!(registry.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_enqueue_on_recycled_handle_retries() {
        let (registry, done) = counting_registry();
        registry.enqueue(key("k"), 1).await.unwrap();

        let stale = registry.get(&key("k")).await.unwrap();
        eventually("drained", || async { !stale.is_running() }).await;

        // Retire the member without removing it from the map.
        assert!(stale.retire_if_idle().await);
        registry.enqueue(key("k"), 2).await.unwrap();

        eventually("item on fresh member", || async { done.load(Ordering::SeqCst) == 2 }).await;
        let fresh = registry.get(&key("k")).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
    }

    #[tokio::test]
    async fn test_pause_applies_to_existing_and_new_members() {
        let (registry, done) = counting_registry();
        registry.enqueue(key("old"), 1).await.unwrap();
        eventually("first item", || async { done.load(Ordering::SeqCst) == 1 }).await;

        registry.pause().await;
        assert!(registry.is_paused());

        registry.enqueue(key("old"), 2).await.unwrap();
        registry.enqueue(key("new"), 3).await.unwrap();
        assert!(registry.get(&key("new")).await.unwrap().is_paused());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);

        // Paused members with pending items are never recycled.
        assert_eq!(registry.recycle_now().await, 0);
        assert_eq!(registry.member_count().await, 2);

        registry.resume().await;
        assert!(!registry.is_paused());
        eventually("all items", || async { done.load(Ordering::SeqCst) == 3 }).await;
    }

    #[tokio::test]
    async fn test_metrics_consistency() {
        let (registry, gate, done) = gated_registry();

        for item in [0, 1, 2] {
            registry.enqueue(key("a"), item).await.unwrap();
        }
        for item in [0, 1] {
            registry.enqueue(key("b"), item).await.unwrap();
        }
        registry.enqueue(key("c"), 9).await.unwrap();

        eventually("c drained, a and b blocked", || async {
            let metrics = registry.metrics().await;
            done.load(Ordering::SeqCst) == 1
                && metrics.active_member_count == 2
                && metrics.total_worker_count == 2
        })
        .await;

        let metrics = registry.metrics().await;
        assert_eq!(metrics.member_count, 3);
        assert!(metrics.active_member_count <= metrics.member_count);
        assert_eq!(metrics.active_member_queue_total_length, 3);
        assert_eq!(metrics.active_member_queue_max_length, 2);
        assert!((metrics.active_member_queue_average_length - 1.5).abs() < f64::EPSILON);
        assert!(metrics.to_string().contains("members: 3 (active 2)"));

        gate.add_permits(2);
        eventually("everything drained", || async { done.load(Ordering::SeqCst) == 6 }).await;
        eventually("no active members", || async {
            registry.metrics().await.active_member_count == 0
        })
        .await;

        let metrics = registry.metrics().await;
        assert_eq!(metrics.active_member_queue_total_length, 0);
        assert_eq!(metrics.active_member_queue_average_length, 0.0);
        assert_eq!(metrics.total_worker_count, 0);
    }

    #[tokio::test]
    async fn test_remove_disposes_member() {
        let (registry, _) = counting_registry();
        registry.enqueue(key("x"), 1).await.unwrap();
        let queue = registry.get(&key("x")).await.unwrap();

        assert!(registry.remove(&key("x")).await);
        assert!(!registry.remove(&key("x")).await);
        assert!(!registry.contains(&key("x")).await);
        assert!(queue.is_disposed());
    }

    #[tokio::test]
    async fn test_failures_reach_sink_with_member_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let action = action_fn(|item: u32| async move {
            if item == 0 {
                Err(AnvilError::action("rejected"))
            } else {
                Ok(())
            }
        });
        let registry =
            KeyedQueueRegistry::with_config("R", action, RegistryConfig::default(), Some(tx))
                .unwrap();

        registry.enqueue(key("alice"), 0).await.unwrap();
        let failure = rx.recv().await.unwrap();
        assert_eq!(failure.queue, "R/alice");
        assert!(matches!(failure.kind, FailureKind::Error(message) if message.contains("rejected")));
    }

    #[tokio::test]
    async fn test_dispose_releases_members() {
        let (registry, _) = counting_registry();
        registry.enqueue(key("a"), 1).await.unwrap();
        registry.enqueue(key("b"), 1).await.unwrap();
        let a = registry.get(&key("a")).await.unwrap();

        registry.dispose().await;
        registry.dispose().await;

        assert_eq!(registry.member_count().await, 0);
        assert!(a.is_disposed());
        assert!(registry.enqueue(key("c"), 1).await.unwrap_err().is_disposed());
    }
}
