//! Rate-limited work queue
//!
//! A keyed FIFO that coalesces duplicate keys, never hands the same key to
//! two workers at once and re-delivers failed keys after a per-key
//! exponential backoff. A key waits on at most one pending delay: a later
//! `add_after` only replaces it when it would fire sooner.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;

/// Base delay of the per-key exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Ceiling of the per-key exponential backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, queued or re-added while in flight
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    /// Earliest pending ready time of each delayed key
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            waiting: HashMap::new(),
            shutting_down: false,
        }
    }
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    /// Flips to true on shutdown, cancelling delayed adds
    closed: watch::Sender<bool>,
    base_delay: Duration,
    max_delay: Duration,
}

/// Cloneable handle to a shared rate-limited queue
pub struct RateLimitedQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RateLimitedQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for RateLimitedQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before the next retry of a key that already failed `failures` times
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u128.checked_shl(failures.min(127)).unwrap_or(u128::MAX);
    let nanos = base.as_nanos().saturating_mul(factor);
    if nanos >= max.as_nanos() {
        max
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

impl<K> RateLimitedQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                closed: watch::channel(false).0,
                base_delay,
                max_delay,
            }),
        }
    }

    /// Enqueue a key unless it is already waiting
    ///
    /// A key added while it is being processed is parked and delivered again
    /// once the worker calls [`done`](Self::done).
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue a key once `delay` has elapsed
    ///
    /// Ignored when the key already waits on a delay that ends no later.
    pub async fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return;
            }
            let sooner = state
                .waiting
                .get(&key)
                .map_or(true, |pending| ready_at < *pending);
            if !sooner {
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let queue = self.clone();
        let mut closed = self.inner.closed.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => queue.fire_delayed(key, ready_at).await,
                _ = closed.changed() => {}
            }
        });
    }

    /// Deliver a delayed key unless a sooner delay replaced this one
    async fn fire_delayed(&self, key: K, ready_at: Instant) {
        {
            let mut state = self.inner.state.lock().await;
            if state.waiting.get(&key) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key).await;
    }

    /// Enqueue a key after its current backoff delay and bump its failure count
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = backoff_delay(self.inner.base_delay, self.inner.max_delay, *failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay).await;
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key returned by [`get`](Self::get) as finished
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Reset the key's backoff
    pub async fn forget(&self, key: &K) {
        self.inner.state.lock().await.failures.remove(key);
    }

    /// Number of rate-limited retries since the key was last forgotten
    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Keys waiting for a worker
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Keys waiting on a delay before they are queued
    pub async fn delayed_len(&self) -> usize {
        self.inner.state.lock().await.waiting.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop accepting keys, drop pending delays and release every blocked `get`
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.closed.send_replace(true);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_coalesced() {
        let q = RateLimitedQueue::new();
        q.add(key("a")).await;
        q.add(key("b")).await;
        q.add(key("a")).await;

        assert_eq!(q.len().await, 2);
        assert_eq!(q.get().await, Some(key("a")));
        assert_eq!(q.get().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_key_added_in_flight_is_redelivered_after_done() {
        let q = RateLimitedQueue::new();
        q.add(key("a")).await;
        let a = q.get().await.unwrap();

        q.add(key("a")).await;
        // still in flight: not handed to another worker
        assert!(q.is_empty().await);

        q.done(&a).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let q = RateLimitedQueue::new();
        q.add(key("a")).await;
        let a = q.get().await.unwrap();
        q.done(&a).await;
        assert!(q.is_empty().await);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = DEFAULT_BASE_DELAY;
        let max = DEFAULT_MAX_DELAY;
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(5));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, max, 30), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn test_rate_limited_add_counts_failures_until_forget() {
        let q = RateLimitedQueue::with_backoff(Duration::from_millis(1), Duration::from_millis(10));
        q.add_rate_limited(key("a")).await;
        q.add_rate_limited(key("a")).await;
        assert_eq!(q.num_requeues(&key("a")).await, 2);

        let delivered = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(delivered, Some(key("a")));

        q.forget(&key("a")).await;
        assert_eq!(q.num_requeues(&key("a")).await, 0);
    }

    #[tokio::test]
    async fn test_delayed_key_keeps_only_earliest_deadline() {
        let q = RateLimitedQueue::new();
        q.add_after(key("a"), Duration::from_millis(20)).await;
        q.add_after(key("a"), Duration::from_millis(60)).await;
        q.add_after(key("a"), Duration::from_secs(600)).await;
        assert_eq!(q.delayed_len().await, 1);

        let a = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap()
            .unwrap();
        q.done(&a).await;
        assert_eq!(q.delayed_len().await, 0);

        // the replaced deadlines must not deliver the key a second time
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_sooner_delay_replaces_pending_one() {
        let q = RateLimitedQueue::new();
        q.add_after(key("a"), Duration::from_secs(600)).await;
        q.add_after(key("a"), Duration::from_millis(20)).await;
        assert_eq!(q.delayed_len().await, 1);

        let got = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .unwrap();
        assert_eq!(got, Some(key("a")));
    }

    #[tokio::test]
    async fn test_repeated_backoff_leaves_one_pending_delay() {
        let q = RateLimitedQueue::with_backoff(Duration::from_secs(1), Duration::from_secs(1000));
        for _ in 0..20 {
            q.add_rate_limited(key("stuck")).await;
        }
        assert_eq!(q.num_requeues(&key("stuck")).await, 20);
        assert_eq!(q.delayed_len().await, 1);

        q.shutdown().await;
        assert_eq!(q.delayed_len().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_blocked_getters() {
        let q: RateLimitedQueue<String> = RateLimitedQueue::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.shutdown().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);

        q.add(key("late")).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_getter_wakes_on_add() {
        let q = RateLimitedQueue::new();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.add(key("a")).await;

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(key("a")));
    }
}
