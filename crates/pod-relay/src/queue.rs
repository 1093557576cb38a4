//! Deduplicating, rate-limited work queue.
//!
//! Items are keyed by [`QueueItem::queue_key`]. While a key is pending, adding
//! it again merges into the pending item, so a burst of updates for one pod
//! collapses into a single unit of work. A key that is being processed is never
//! handed to a second worker: re-adds are parked until [`RateLimitingQueue::done`].
//!
//! Failed items go back in through [`RateLimitingQueue::add_rate_limited`],
//! which delays them with a per-key exponential backoff. Successful items are
//! acknowledged with [`RateLimitingQueue::forget`].

use crate::backoff::ItemExponentialBackoff;
use crate::event::QueueItem;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct QueueState<T> {
    /// Keys ready to be handed out, in arrival order
    order: VecDeque<String>,
    /// Items not yet dequeued, including ones parked behind an in-flight key
    pending: HashMap<String, T>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Work queue with per-key coalescing and exponential retry backoff.
pub struct RateLimitingQueue<T: QueueItem> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    limiter: Mutex<ItemExponentialBackoff>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl<T: QueueItem> std::fmt::Debug for RateLimitingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl<T: QueueItem> RateLimitingQueue<T> {
    /// Creates an empty queue using `limiter` for retry delays.
    #[must_use]
    pub fn new(name: &'static str, limiter: ItemExponentialBackoff) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: HashMap::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            limiter: Mutex::new(limiter),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_limiter(&self) -> MutexGuard<'_, ItemExponentialBackoff> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Adds an item. A no-op after shutdown; merges into the pending item if the
    /// key is already queued.
    ///
    /// Returns `true` only when a new pending entry was created.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.lock_state();
        if state.shutting_down {
            return false;
        }

        let key = item.queue_key().to_string();
        if let Some(pending) = state.pending.get_mut(&key) {
            pending.merge(item);
            debug!(queue = self.name, key = %key, "coalesced into pending item");
            return false;
        }

        state.pending.insert(key.clone(), item);
        if state.processing.contains(&key) {
            // Re-queued by done() once the current worker finishes
            return true;
        }
        state.order.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Waits for the next item. Returns `None` once the queue is shutting down,
    /// even if items are still pending.
    ///
    /// The caller owns the returned key until it calls [`Self::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a concurrent add or shutdown
            // cannot slip between the check and the wait
            notified.as_mut().enable();

            {
                let mut state = self.lock_state();
                if state.shutting_down {
                    return None;
                }
                while let Some(key) = state.order.pop_front() {
                    if let Some(item) = state.pending.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                }
            }

            notified.await;
        }
    }

    /// Marks the item's key as no longer in flight. If the key was re-added
    /// meanwhile, it becomes available again.
    pub fn done(&self, item: &T) {
        let mut state = self.lock_state();
        let key = item.queue_key();
        state.processing.remove(key);
        if state.pending.contains_key(key) && !state.shutting_down {
            state.order.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Clears the retry history of the item's key.
    pub fn forget(&self, item: &T) {
        self.lock_limiter().forget(item.queue_key());
    }

    /// Number of times the item's key has been re-queued since it was last
    /// forgotten.
    #[must_use]
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock_limiter().num_requeues(item.queue_key())
    }

    /// Re-adds the item after its key's next backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.lock_limiter().when(item.queue_key());
        self.add_after(item, delay);
    }

    /// Re-adds the item once `delay` has elapsed, unless the queue shuts down
    /// first.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        debug!(queue = self.name, key = %item.queue_key(), delay_ms = delay.as_millis(), "scheduling retry");
        let queue = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    queue.add(item);
                }
            }
        });
    }

    /// Stops handing out items and wakes every blocked [`Self::get`].
    pub fn shut_down(&self) {
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        info!(queue = self.name, "shutting down queue");
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// Whether [`Self::shut_down`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    /// Number of pending (not yet dequeued) items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Whether no items are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an item with `key` is pending.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock_state().pending.contains_key(key)
    }
}
