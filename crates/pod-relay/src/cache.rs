//! Resource cache.
//!
//! Mirrors the pods of one namespace from a `kube_runtime` watcher stream into
//! a local store keyed by `namespace/name`, and turns every change into a
//! canonical [`Event`] on the work queue. The store is only readable once the
//! first full listing has landed.
//!
//! The watcher re-lists after a disconnect. A re-list is diffed against the
//! store, so objects that vanished while the watch was down still produce a
//! delete.

use crate::error::RelayError;
use crate::event::{Event, EventType, object_key};
use crate::metrics::RelayMetrics;
use crate::queue::RateLimitingQueue;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stream of pod watch events the cache consumes.
pub type PodEventStream = BoxStream<'static, Result<watcher::Event<Pod>, watcher::Error>>;

/// Raw store change, translated into a queue event in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Notification {
    Added(String),
    Updated(String),
    Deleted(String),
}

/// Local mirror of the watched pods.
pub struct PodCache {
    store: RwLock<HashMap<String, Arc<Pod>>>,
    synced: watch::Sender<bool>,
    resync_period: Duration,
    queue: Arc<RateLimitingQueue<Event>>,
    metrics: Arc<RelayMetrics>,
}

impl std::fmt::Debug for PodCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodCache")
            .field("synced", &self.has_synced())
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

impl PodCache {
    /// Creates an empty, unsynced cache feeding `queue`.
    #[must_use]
    pub fn new(
        queue: Arc<RateLimitingQueue<Event>>,
        resync_period: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store: RwLock::new(HashMap::new()),
            synced,
            resync_period,
            queue,
            metrics,
        }
    }

    /// Watch stream for every pod in `namespace`, with the watcher's default
    /// reconnect backoff.
    #[must_use]
    pub fn watch_stream(client: Client, namespace: &str) -> PodEventStream {
        let api: Api<Pod> = Api::namespaced(client, namespace);
        watcher(api, watcher::Config::default()).default_backoff().boxed()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Pod>>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Pod>>> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consumes `stream` until it ends or `stop` fires.
    ///
    /// Watch errors are logged and skipped; the watcher itself reconnects and
    /// re-lists.
    pub async fn start(&self, mut stream: PodEventStream, stop: CancellationToken) {
        info!(resync_period = ?self.resync_period, "starting pod cache");

        let mut relist: Option<HashMap<String, Arc<Pod>>> = None;
        let mut resync = tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    info!("stop signal received, pod cache exiting");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event, &mut relist),
                    Some(Err(e)) => warn!(error = %e, "pod watch error, watcher will retry"),
                    None => {
                        warn!("pod watch stream ended");
                        break;
                    }
                },
                _ = resync.tick() => self.resync(),
            }
        }
    }

    fn apply(&self, event: watcher::Event<Pod>, relist: &mut Option<HashMap<String, Arc<Pod>>>) {
        match event {
            watcher::Event::Init => {
                debug!("pod list started");
                *relist = Some(HashMap::new());
            }
            watcher::Event::InitApply(pod) => match relist.as_mut() {
                Some(buffer) => {
                    if let Some(key) = object_key(&pod.metadata) {
                        buffer.insert(key, Arc::new(pod));
                    }
                }
                None => self.upsert(pod),
            },
            watcher::Event::InitDone => {
                let listed = relist.take().unwrap_or_default();
                self.replace(listed);
            }
            watcher::Event::Apply(pod) => self.upsert(pod),
            watcher::Event::Delete(pod) => {
                let Some(key) = object_key(&pod.metadata) else {
                    return;
                };
                let removed = self.write_store().remove(&key).is_some();
                if removed {
                    self.translate(Notification::Deleted(key));
                }
            }
        }
    }

    fn upsert(&self, pod: Pod) {
        let Some(key) = object_key(&pod.metadata) else {
            warn!("ignoring pod without a name");
            return;
        };
        let existed = self.write_store().insert(key.clone(), Arc::new(pod)).is_some();
        self.translate(if existed {
            Notification::Updated(key)
        } else {
            Notification::Added(key)
        });
    }

    /// Swaps in a complete listing and marks the cache synced.
    fn replace(&self, listed: HashMap<String, Arc<Pod>>) {
        let mut notifications = Vec::with_capacity(listed.len());
        {
            let mut store = self.write_store();
            for key in store.keys() {
                if !listed.contains_key(key) {
                    notifications.push(Notification::Deleted(key.clone()));
                }
            }
            for key in listed.keys() {
                notifications.push(if store.contains_key(key) {
                    Notification::Updated(key.clone())
                } else {
                    Notification::Added(key.clone())
                });
            }
            *store = listed;
        }

        let count = notifications.len();
        for notification in notifications {
            self.translate(notification);
        }

        if !self.has_synced() {
            info!(pods = self.len(), "pod cache synced");
        } else {
            debug!(changes = count, "pod cache re-listed");
        }
        self.synced.send_replace(true);
    }

    fn resync(&self) {
        if !self.has_synced() {
            return;
        }
        let keys: Vec<String> = self.read_store().keys().cloned().collect();
        debug!(pods = keys.len(), "periodic resync");
        for key in keys {
            self.translate(Notification::Updated(key));
        }
    }

    fn translate(&self, notification: Notification) {
        let event = match notification {
            Notification::Added(key) => Event::pod(key, EventType::Create),
            Notification::Updated(key) => Event::pod(key, EventType::Update),
            Notification::Deleted(key) => Event::pod(key, EventType::Delete),
        };
        debug!(key = %event.key, event_type = %event.event_type, "enqueueing pod event");
        if self.queue.add(event) {
            self.metrics.events_enqueued.inc();
        }
        self.metrics
            .queue_depth
            .set(i64::try_from(self.queue.len()).unwrap_or(i64::MAX));
    }

    /// Whether the initial listing has landed.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the cache has synced.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Current snapshot of the pod at `key`.
    pub fn get_by_key(&self, key: &str) -> Result<Option<Arc<Pod>>, RelayError> {
        if !self.has_synced() {
            return Err(RelayError::NotSynced);
        }
        Ok(self.read_store().get(key).cloned())
    }

    /// Every cached pod, sorted by key.
    pub fn list(&self) -> Result<Vec<(String, Arc<Pod>)>, RelayError> {
        if !self.has_synced() {
            return Err(RelayError::NotSynced);
        }
        let mut pods: Vec<(String, Arc<Pod>)> = self
            .read_store()
            .iter()
            .map(|(key, pod)| (key.clone(), Arc::clone(pod)))
            .collect();
        pods.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(pods)
    }

    /// Number of cached pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_store().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_store().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ItemExponentialBackoff;
    use futures::channel::mpsc;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    type Feed = mpsc::UnboundedSender<Result<watcher::Event<Pod>, watcher::Error>>;

    fn pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn start_cache() -> (Arc<PodCache>, Arc<RateLimitingQueue<Event>>, Feed, CancellationToken) {
        let queue = Arc::new(RateLimitingQueue::new("test", ItemExponentialBackoff::default()));
        let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
        let cache = Arc::new(PodCache::new(Arc::clone(&queue), Duration::from_secs(30), metrics));
        let (tx, rx) = mpsc::unbounded();
        let stop = CancellationToken::new();

        let runner = Arc::clone(&cache);
        let token = stop.clone();
        tokio::spawn(async move { runner.start(rx.boxed(), token).await });

        (cache, queue, tx, stop)
    }

    fn send(feed: &Feed, event: watcher::Event<Pod>) {
        feed.unbounded_send(Ok(event)).expect("cache running");
    }

    async fn next_event(queue: &RateLimitingQueue<Event>) -> Event {
        let event = queue.get().await.expect("queue open");
        queue.done(&event);
        event
    }

    #[tokio::test]
    async fn test_reads_fail_before_sync() {
        let (cache, _queue, feed, _stop) = start_cache();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Pending")));

        assert!(!cache.has_synced());
        assert!(matches!(cache.get_by_key("default/web-1"), Err(RelayError::NotSynced)));
        assert!(matches!(cache.list(), Err(RelayError::NotSynced)));
    }

    #[tokio::test]
    async fn test_initial_list_emits_creates_after_sync() {
        let (cache, queue, feed, _stop) = start_cache();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Pending")));
        send(&feed, watcher::Event::InitApply(pod("web-2", "Running")));
        send(&feed, watcher::Event::InitDone);

        cache.wait_for_sync().await;
        assert_eq!(cache.len(), 2);
        assert_eq!(queue.len(), 2);

        let mut events = vec![next_event(&queue).await, next_event(&queue).await];
        events.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(events[0], Event::pod("default/web-1", EventType::Create));
        assert_eq!(events[1], Event::pod("default/web-2", EventType::Create));

        let cached = cache.get_by_key("default/web-1").expect("synced").expect("cached");
        assert_eq!(cached.status.as_ref().and_then(|s| s.phase.as_deref()), Some("Pending"));
    }

    #[tokio::test]
    async fn test_watch_changes_after_sync() {
        let (cache, queue, feed, _stop) = start_cache();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Pending")));
        send(&feed, watcher::Event::InitDone);
        cache.wait_for_sync().await;
        next_event(&queue).await;

        send(&feed, watcher::Event::Apply(pod("web-1", "Running")));
        assert_eq!(next_event(&queue).await, Event::pod("default/web-1", EventType::Update));

        send(&feed, watcher::Event::Apply(pod("web-3", "Pending")));
        assert_eq!(next_event(&queue).await, Event::pod("default/web-3", EventType::Create));

        send(&feed, watcher::Event::Delete(pod("web-1", "Running")));
        assert_eq!(next_event(&queue).await, Event::pod("default/web-1", EventType::Delete));
        assert!(cache.get_by_key("default/web-1").expect("synced").is_none());
        assert_eq!(cache.list().expect("synced").len(), 1);
    }

    #[tokio::test]
    async fn test_relist_deletes_vanished_pods() {
        let (cache, queue, feed, _stop) = start_cache();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Running")));
        send(&feed, watcher::Event::InitApply(pod("web-2", "Running")));
        send(&feed, watcher::Event::InitDone);
        cache.wait_for_sync().await;
        next_event(&queue).await;
        next_event(&queue).await;

        // Reconnect: web-2 disappeared while the watch was down
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Running")));
        send(&feed, watcher::Event::InitDone);

        let mut events = vec![next_event(&queue).await, next_event(&queue).await];
        events.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(events[0], Event::pod("default/web-1", EventType::Update));
        assert_eq!(events[1], Event::pod("default/web-2", EventType::Delete));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resync_requeues_every_key() {
        let (cache, queue, feed, _stop) = start_cache();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Running")));
        send(&feed, watcher::Event::InitApply(pod("web-2", "Running")));
        send(&feed, watcher::Event::InitDone);
        cache.wait_for_sync().await;
        next_event(&queue).await;
        next_event(&queue).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(next_event(&queue).await.event_type, EventType::Update);
    }

    fn start_cache_with_metrics() -> (Arc<PodCache>, Arc<RelayMetrics>, Feed) {
        let queue = Arc::new(RateLimitingQueue::new("test", ItemExponentialBackoff::default()));
        let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
        let cache = Arc::new(PodCache::new(queue, Duration::from_secs(30), Arc::clone(&metrics)));
        let (tx, rx) = mpsc::unbounded();

        let runner = Arc::clone(&cache);
        tokio::spawn(async move { runner.start(rx.boxed(), CancellationToken::new()).await });

        (cache, metrics, tx)
    }

    #[tokio::test]
    async fn test_watch_error_does_not_stop_the_loop() {
        let (cache, queue, feed, _stop) = start_cache();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Pending")));
        send(&feed, watcher::Event::InitDone);
        cache.wait_for_sync().await;
        next_event(&queue).await;

        feed.unbounded_send(Err(watcher::Error::NoResourceVersion)).expect("cache running");
        send(&feed, watcher::Event::Apply(pod("web-2", "Pending")));

        assert_eq!(next_event(&queue).await, Event::pod("default/web-2", EventType::Create));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_enqueued_counts_only_new_entries() {
        let (cache, metrics, feed) = start_cache_with_metrics();
        send(&feed, watcher::Event::Init);
        send(&feed, watcher::Event::InitApply(pod("web-1", "Pending")));
        send(&feed, watcher::Event::InitDone);
        // Nobody drains the queue, so these merge into the pending create
        send(&feed, watcher::Event::Apply(pod("web-1", "Running")));
        send(&feed, watcher::Event::Apply(pod("web-1", "Succeeded")));
        send(&feed, watcher::Event::Apply(pod("web-2", "Pending")));

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events applied");
        assert_eq!(metrics.events_enqueued.get(), 2);
    }

    #[tokio::test]
    async fn test_stop_ends_the_loop() {
        let queue = Arc::new(RateLimitingQueue::new("test", ItemExponentialBackoff::default()));
        let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
        let cache = PodCache::new(queue, Duration::from_secs(30), metrics);
        let (_feed, rx) = mpsc::unbounded::<Result<watcher::Event<Pod>, watcher::Error>>();
        let stop = CancellationToken::new();
        stop.cancel();

        // Returns immediately rather than waiting on the idle stream
        cache.start(rx.boxed(), stop).await;
        assert!(!cache.has_synced());
    }
}
