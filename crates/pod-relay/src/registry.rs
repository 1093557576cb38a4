//! Subscriber registry.
//!
//! Maps a client ID to a private bounded channel of [`StatusRecord`]s. All
//! mutation goes through one reader/writer lock: open and close take it
//! exclusively, broadcast takes it shared and delivers to every channel in
//! turn before releasing it.
//!
//! With [`BackpressurePolicy::Block`] a full channel stalls the broadcast, and
//! with it delivery to every other subscriber, until its reader catches up. A
//! reader that goes away must close its [`Subscription`] first; that fails the
//! pending send and lets the broadcast move on before the entry is removed.

use crate::event::StatusRecord;
use crate::metrics::RelayMetrics;
use async_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// What a broadcast does when a subscriber's channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Wait for the subscriber to drain its channel. Nothing is lost.
    #[default]
    Block,
    /// Evict the oldest undelivered record to make room. Slow subscribers
    /// miss records but never delay anyone else.
    DropOldest,
}

/// Reading end of a subscriber channel.
#[derive(Debug, Clone)]
pub struct Subscription {
    client_id: String,
    receiver: Receiver<StatusRecord>,
}

impl Subscription {
    /// Client this subscription belongs to.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Waits for the next record. `None` once the channel is closed and empty.
    pub async fn recv(&self) -> Option<StatusRecord> {
        self.receiver.recv().await.ok()
    }

    /// Takes a record if one is buffered.
    #[must_use]
    pub fn try_recv(&self) -> Option<StatusRecord> {
        self.receiver.try_recv().ok()
    }

    /// Closes the channel from the reading side, failing any blocked send.
    pub fn close(&self) {
        self.receiver.close();
    }

    /// Whether the channel has been closed by either side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no record is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Whether both subscriptions read from the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Subscription) -> bool {
        self.receiver.same_channel(&other.receiver)
    }
}

struct SubscriberEntry {
    sender: Sender<StatusRecord>,
    receiver: Receiver<StatusRecord>,
}

/// Concurrency-safe client ID → channel map.
pub struct SubscriberRegistry {
    entries: RwLock<HashMap<String, SubscriberEntry>>,
    /// Serialises broadcasts so every subscriber sees the same order
    broadcast_order: Mutex<()>,
    capacity: usize,
    policy: BackpressurePolicy,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SubscriberRegistry {
    /// Creates an empty registry. `capacity` is clamped to at least 1.
    #[must_use]
    pub fn new(capacity: usize, policy: BackpressurePolicy, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            broadcast_order: Mutex::new(()),
            capacity: capacity.max(1),
            policy,
            metrics,
        }
    }

    /// Returns the subscription for `client_id`, creating its channel on first
    /// use. Opening an ID that is already registered returns the same channel.
    pub async fn open(&self, client_id: &str) -> Subscription {
        let mut entries = self.entries.write().await;

        // A channel closed by its reader but not yet removed is replaced
        if entries.get(client_id).is_some_and(|e| e.sender.is_closed()) {
            entries.remove(client_id);
        }

        let capacity = self.capacity;
        let entry = entries.entry(client_id.to_string()).or_insert_with(|| {
            info!(client_id = %client_id, capacity, "opening subscriber channel");
            let (sender, receiver) = async_channel::bounded(capacity);
            SubscriberEntry { sender, receiver }
        });
        let subscription = Subscription {
            client_id: client_id.to_string(),
            receiver: entry.receiver.clone(),
        };

        self.metrics.subscribers.set(i64::try_from(entries.len()).unwrap_or(i64::MAX));
        subscription
    }

    /// Closes and removes the channel for `client_id`. Unknown IDs are ignored.
    ///
    /// Returns whether an entry was removed.
    pub async fn close(&self, client_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get(client_id) else {
            debug!(client_id = %client_id, "close for unknown subscriber ignored");
            return false;
        };

        entry.sender.close();
        entries.remove(client_id);
        info!(client_id = %client_id, remaining = entries.len(), "closed subscriber channel");
        self.metrics.subscribers.set(i64::try_from(entries.len()).unwrap_or(i64::MAX));
        true
    }

    /// Closes and removes every channel.
    pub async fn close_all(&self) {
        let mut entries = self.entries.write().await;
        for entry in entries.values() {
            entry.sender.close();
        }
        let closed = entries.len();
        entries.clear();
        self.metrics.subscribers.set(0);
        if closed > 0 {
            info!(closed, "closed all subscriber channels");
        }
    }

    /// Delivers `record` to every open channel, one at a time, under the
    /// shared lock. Returns how many subscribers accepted it.
    pub async fn broadcast(&self, record: &StatusRecord) -> usize {
        let _order = self.broadcast_order.lock().await;
        let entries = self.entries.read().await;

        let mut delivered = 0;
        for (client_id, entry) in entries.iter() {
            let accepted = match self.policy {
                BackpressurePolicy::Block => entry.sender.send(record.clone()).await.is_ok(),
                BackpressurePolicy::DropOldest => match entry.sender.force_send(record.clone()) {
                    Ok(None) => true,
                    Ok(Some(evicted)) => {
                        debug!(client_id = %client_id, pod = %evicted.pod_name, "evicted undelivered record");
                        self.metrics.records_dropped.inc();
                        true
                    }
                    Err(_) => false,
                },
            };

            if accepted {
                delivered += 1;
            } else {
                debug!(client_id = %client_id, "subscriber channel closed, skipping");
            }
        }

        self.metrics.records_broadcast.inc_by(delivered as u64);
        delivered
    }

    /// Number of registered subscribers.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no subscriber is registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Whether `client_id` is registered.
    pub async fn contains(&self, client_id: &str) -> bool {
        self.entries.read().await.contains_key(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use std::time::Duration;

    fn registry(policy: BackpressurePolicy) -> SubscriberRegistry {
        let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
        SubscriberRegistry::new(1, policy, metrics)
    }

    fn record(pod: &str) -> StatusRecord {
        StatusRecord {
            message: EventType::Update,
            pod_state: "Running".to_string(),
            pod_ip: String::new(),
            node_name: String::new(),
            pod_name: pod.to_string(),
            host_ip: String::new(),
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let reg = registry(BackpressurePolicy::Block);

        let first = reg.open("bot-1").await;
        let second = reg.open("bot-1").await;

        assert!(first.same_channel(&second));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_close_unknown_and_twice_is_noop() {
        let reg = registry(BackpressurePolicy::Block);

        assert!(!reg.close("nobody").await);

        let sub = reg.open("bot-1").await;
        assert!(reg.close("bot-1").await);
        assert!(!reg.close("bot-1").await);
        assert!(sub.is_closed());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_lets_reader_observe_closure() {
        let reg = registry(BackpressurePolicy::Block);
        let sub = reg.open("bot-1").await;

        reg.broadcast(&record("web-1")).await;
        reg.close("bot-1").await;

        // Buffered record is still readable, then the channel reports closed
        assert_eq!(sub.recv().await.map(|r| r.pod_name), Some("web-1".to_string()));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reopen_after_reader_closed() {
        let reg = registry(BackpressurePolicy::Block);
        let old = reg.open("bot-1").await;
        old.close();

        let new = reg.open("bot-1").await;
        assert!(!new.same_channel(&old));
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_blocks_on_full_channel_without_loss() {
        let reg = Arc::new(registry(BackpressurePolicy::Block));
        let a = reg.open("a").await;
        let b = reg.open("b").await;

        assert_eq!(reg.broadcast(&record("r1")).await, 2);

        let second = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.broadcast(&record("r2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "broadcast must wait for full channels");

        assert_eq!(a.recv().await.map(|r| r.pod_name), Some("r1".to_string()));
        assert_eq!(b.recv().await.map(|r| r.pod_name), Some("r1".to_string()));
        assert_eq!(second.await.expect("task"), 2);

        assert_eq!(a.recv().await.map(|r| r.pod_name), Some("r2".to_string()));
        assert_eq!(b.recv().await.map(|r| r.pod_name), Some("r2".to_string()));
    }

    #[tokio::test]
    async fn test_reader_close_unblocks_stalled_broadcast() {
        let reg = Arc::new(registry(BackpressurePolicy::Block));
        let stalled = reg.open("stalled").await;

        reg.broadcast(&record("r1")).await;
        let blocked = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.broadcast(&record("r2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        stalled.close();
        assert_eq!(blocked.await.expect("task"), 0);
        assert!(reg.close("stalled").await);
    }

    #[tokio::test]
    async fn test_drop_oldest_never_blocks() {
        let reg = registry(BackpressurePolicy::DropOldest);
        let sub = reg.open("slow").await;

        reg.broadcast(&record("r1")).await;
        reg.broadcast(&record("r2")).await;
        reg.broadcast(&record("r3")).await;

        assert_eq!(sub.len(), 1);
        assert_eq!(sub.try_recv().map(|r| r.pod_name), Some("r3".to_string()));
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_subscribers() {
        let reg = registry(BackpressurePolicy::Block);
        let gone = reg.open("gone").await;
        let live = reg.open("live").await;

        gone.close();
        assert_eq!(reg.broadcast(&record("r1")).await, 1);
        assert_eq!(live.try_recv().map(|r| r.pod_name), Some("r1".to_string()));
    }
}
