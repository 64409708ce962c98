//! Deduplicating, rate-limited work queue
//!
//! Keys move through three sets:
//! - `dirty`: keys that need processing (each key at most once)
//! - `processing`: keys handed to a worker and not yet marked done
//! - `queue`: FIFO order of dirty keys that are not being processed
//!
//! A key re-added while a worker holds it stays dirty but is not queued; it
//! is queued again by [`WorkQueue::done`]. This gives at-most-one-in-flight
//! per key and coalesces any number of changes observed during processing
//! into one re-delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::retry::ExponentialBackoff;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<QueueState<K>>,
    /// Signalled when a key is queued or the queue shuts down
    available: Notify,
    /// Signalled when a worker marks a key done
    released: Notify,
    backoff: ExponentialBackoff,
}

/// Work queue handing keys to concurrent workers
///
/// Cloning is cheap and yields a handle to the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    /// Create a queue with the default per-key backoff
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::default())
    }

    /// Create a queue whose rate-limited adds use the given backoff
    pub fn with_backoff(backoff: ExponentialBackoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                released: Notify::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // A poisoned lock only means a panic elsewhere; the sets stay consistent
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark a key as needing processing. Idempotent while the key is pending.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Queued again by done()
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.available.notify_one();
    }

    /// Add a key once `delay` has elapsed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add a key after a backoff that grows with each consecutive failure
    pub fn add_rate_limited(&self, key: K) {
        let attempt = {
            let mut state = self.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };
        let delay = self.shared.backoff.delay_for(attempt);
        debug!(?key, attempt, delay_ms = delay.as_millis(), "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Clear the failure history of a key
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Number of rate-limited requeues since the key was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is not handed to any other caller until
    /// [`WorkQueue::done`] is called for it.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                // Register before releasing the lock so no wakeup is lost
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Mark a key as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key) && !state.shutting_down;
        if requeue {
            state.queue.push_back(key.clone());
        }
        drop(state);
        if requeue {
            self.shared.available.notify_one();
        }
        self.shared.released.notify_waiters();
    }

    /// Stop handing out keys and wake every waiting `get`. Idempotent.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        drop(state);
        self.shared.available.notify_waiters();
    }

    /// Shut down and wait until every in-flight key has been marked done
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            {
                let state = self.lock();
                if state.processing.is_empty() {
                    return;
                }
                released.as_mut().enable();
            }
            released.await;
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
