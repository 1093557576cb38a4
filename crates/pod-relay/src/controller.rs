//! Event processor.
//!
//! [`PodController`] owns the cache, the work queue and the subscriber
//! registry. `run` drives it through
//! `NotStarted → Syncing → Running → Draining → Stopped`: the cache must sync
//! within the configured timeout before any worker starts, and on stop the
//! queue is shut down and in-flight work is given the drain timeout to finish.
//!
//! Each worker takes one event at a time, resolves its key against the cache
//! and broadcasts the resulting [`StatusRecord`]. A key that is no longer
//! cached is a failure and goes back through the rate-limited retry path.
//! Failed events are retried until they succeed unless
//! [`RelayConfig::max_retries`] caps them; giving up is logged and counted.

use crate::backoff::ItemExponentialBackoff;
use crate::cache::{PodCache, PodEventStream};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::event::{Event, EventType, StatusRecord};
use crate::metrics::RelayMetrics;
use crate::queue::RateLimitingQueue;
use crate::registry::{SubscriberRegistry, Subscription};
use kube::Client;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`PodController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, `run` not called yet
    NotStarted,
    /// Waiting for the initial pod list
    Syncing,
    /// Workers are processing events
    Running,
    /// Queue shut down, in-flight work finishing
    Draining,
    /// Workers gone and subscriptions closed
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::NotStarted => "not-started",
            ControllerState::Syncing => "syncing",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Drains the pod queue and fans status records out to subscribers.
pub struct PodController {
    config: RelayConfig,
    cache: Arc<PodCache>,
    queue: Arc<RateLimitingQueue<Event>>,
    registry: SubscriberRegistry,
    metrics: Arc<RelayMetrics>,
    state: watch::Sender<ControllerState>,
    source: Mutex<Option<PodEventStream>>,
}

impl fmt::Debug for PodController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodController")
            .field("namespace", &self.config.namespace)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl PodController {
    /// Creates a controller that will consume `source` once [`Self::run`] is
    /// called.
    pub fn new(source: PodEventStream, config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        config.validate()?;

        let metrics = Arc::new(RelayMetrics::new()?);
        let queue = Arc::new(RateLimitingQueue::new(
            "pods",
            ItemExponentialBackoff::new(config.backoff_base, config.backoff_max),
        ));
        let cache = Arc::new(PodCache::new(
            Arc::clone(&queue),
            config.resync_period,
            Arc::clone(&metrics),
        ));
        let registry = SubscriberRegistry::new(
            config.channel_capacity,
            config.backpressure,
            Arc::clone(&metrics),
        );
        let (state, _) = watch::channel(ControllerState::NotStarted);

        Ok(Arc::new(Self {
            config,
            cache,
            queue,
            registry,
            metrics,
            state,
            source: Mutex::new(Some(source)),
        }))
    }

    /// Creates a controller watching the pods of `config.namespace`.
    pub fn for_namespace(client: Client, config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let source = PodCache::watch_stream(client, &config.namespace);
        Self::new(source, config)
    }

    fn set_state(&self, state: ControllerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "pod controller state changed");
        }
    }

    /// Runs the controller until `stop` fires.
    ///
    /// Fails with [`RelayError::SyncTimeout`] if the cache does not sync in
    /// time and with [`RelayError::SyncAborted`] if `stop` fires first; no
    /// worker is started in either case.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<(), RelayError> {
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RelayError::AlreadyStarted)?;

        info!(namespace = %self.config.namespace, workers = self.config.workers, "starting pod controller");
        self.set_state(ControllerState::Syncing);

        let cache_stop = stop.child_token();
        let cache_task = {
            let cache = Arc::clone(&self.cache);
            let token = cache_stop.clone();
            tokio::spawn(async move { cache.start(source, token).await })
        };

        let synced = tokio::select! {
            () = self.cache.wait_for_sync() => Ok(()),
            () = tokio::time::sleep(self.config.sync_timeout) => {
                Err(RelayError::SyncTimeout(self.config.sync_timeout))
            }
            () = stop.cancelled() => Err(RelayError::SyncAborted),
        };
        if let Err(e) = synced {
            error!(error = %e, "pod cache did not sync, not starting workers");
            cache_stop.cancel();
            self.queue.shut_down();
            if let Err(join) = cache_task.await {
                warn!(error = %join, "pod cache task failed");
            }
            self.set_state(ControllerState::Stopped);
            return Err(e);
        }

        self.set_state(ControllerState::Running);
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let controller = Arc::clone(&self);
            workers.spawn(async move { controller.worker(id).await });
        }

        stop.cancelled().await;

        self.set_state(ControllerState::Draining);
        self.queue.shut_down();
        cache_stop.cancel();

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            // A worker stuck on a full subscriber channel holds the registry
            // read lock; aborting it lets close_all proceed
            warn!(timeout = ?self.config.drain_timeout, "drain timed out, aborting workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        if let Err(join) = cache_task.await {
            warn!(error = %join, "pod cache task failed");
        }

        self.registry.close_all().await;
        self.set_state(ControllerState::Stopped);
        info!("pod controller stopped");
        Ok(())
    }

    async fn worker(self: Arc<Self>, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item().await {}
        debug!(worker = id, "worker exiting");
    }

    /// Handles one queue item. Returns `false` once the queue is shutting down.
    async fn process_next_item(&self) -> bool {
        let Some(event) = self.queue.get().await else {
            return false;
        };
        self.metrics
            .queue_depth
            .set(i64::try_from(self.queue.len()).unwrap_or(i64::MAX));

        match self.process_item(&event).await {
            Ok(delivered) => {
                debug!(key = %event.key, event_type = %event.event_type, delivered, "processed pod event");
                self.metrics.events_processed.inc();
                self.queue.forget(&event);
            }
            Err(e) => self.handle_err(&event, &e),
        }
        self.queue.done(&event);
        true
    }

    async fn process_item(&self, event: &Event) -> Result<usize, RelayError> {
        let pod = self
            .cache
            .get_by_key(&event.key)?
            .ok_or_else(|| RelayError::StaleKey(event.key.clone()))?;
        let record = StatusRecord::from_pod(event.event_type, &pod);
        Ok(self.registry.broadcast(&record).await)
    }

    fn handle_err(&self, event: &Event, err: &RelayError) {
        self.metrics.event_failures.inc();

        let retries = self.queue.num_requeues(event);
        let exhausted = self.config.max_retries.is_some_and(|max| retries >= max);
        if !exhausted {
            warn!(key = %event.key, event_type = %event.event_type, retries, error = %err, "processing failed, retrying with backoff");
            self.metrics.event_retries.inc();
            self.queue.add_rate_limited(event.clone());
            return;
        }

        if event.event_type == EventType::Delete {
            // The pod is gone from the cache, so there is nothing left to relay
            info!(key = %event.key, retries, "giving up on delete of vanished pod");
        } else {
            error!(key = %event.key, event_type = %event.event_type, retries, error = %err, "giving up on pod event after repeated failures");
        }
        self.queue.forget(event);
        self.metrics.events_dropped.inc();
    }

    /// Returns the subscription for `client_id`, creating it on first use.
    pub async fn open_channel(&self, client_id: &str) -> Subscription {
        self.registry.open(client_id).await
    }

    /// Closes the channel for `client_id`. A no-op for unknown IDs.
    pub async fn close_channel(&self, client_id: &str) -> bool {
        self.registry.close(client_id).await
    }

    /// Status of every cached pod, sorted by key.
    pub fn snapshot(&self) -> Result<Vec<StatusRecord>, RelayError> {
        Ok(self
            .cache
            .list()?
            .iter()
            .map(|(_, pod)| StatusRecord::from_pod(EventType::Update, pod))
            .collect())
    }

    /// Status of the pod at `key`, if cached.
    pub fn status_by_key(&self, key: &str) -> Result<Option<StatusRecord>, RelayError> {
        Ok(self
            .cache
            .get_by_key(key)?
            .map(|pod| StatusRecord::from_pod(EventType::Update, &pod)))
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &PodCache {
        &self.cache
    }

    #[must_use]
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }
}
