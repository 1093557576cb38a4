//! Watch-only modes.
//!
//! `--watch-only` runs the pod cache alone and logs every canonical event.
//! `--watch-deployments` does the same for the Deployments of the namespace,
//! logging creates, replica changes and deletes.

use crate::error::ServerError;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, watcher};
use pod_relay::{
    EventType, ItemExponentialBackoff, PodCache, PodEventStream, RateLimitingQueue, RelayConfig,
    RelayError, RelayMetrics, object_key,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deployment watch events for one namespace.
pub type DeploymentEventStream = BoxStream<'static, Result<watcher::Event<Deployment>, watcher::Error>>;

/// Logs each canonical pod event from `source` until `stop` fires or the
/// watch ends. Returns how many events were logged.
pub async fn log_events(
    source: PodEventStream,
    config: &RelayConfig,
    stop: CancellationToken,
) -> Result<u64, ServerError> {
    let metrics = Arc::new(RelayMetrics::new().map_err(RelayError::from)?);
    let queue = Arc::new(RateLimitingQueue::new(
        "pod-watch",
        ItemExponentialBackoff::new(config.backoff_base, config.backoff_max),
    ));
    let cache = PodCache::new(Arc::clone(&queue), config.resync_period, metrics);

    let cache_task = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            cache.start(source, stop).await;
            queue.shut_down();
        })
    };

    info!(namespace = %config.namespace, "watching pods");
    let mut logged = 0;
    while let Some(event) = queue.get().await {
        info!(key = %event.key, event_type = %event.event_type, resource = event.resource_type, "pod event");
        queue.done(&event);
        logged += 1;
    }

    if let Err(e) = cache_task.await {
        warn!(error = %e, "pod cache task failed");
    }
    info!(logged, "pod watch stopped");
    Ok(logged)
}

/// Watch stream for every Deployment in `namespace`.
#[must_use]
pub fn deployment_watch_stream(client: Client, namespace: &str) -> DeploymentEventStream {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    watcher(api, watcher::Config::default()).default_backoff().boxed()
}

/// A Deployment create, update or delete as seen by the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentChange {
    pub event_type: EventType,
    /// `namespace/name`
    pub key: String,
    /// Replicas reported in status
    pub replicas: i32,
    /// Available replicas reported in status
    pub available: i32,
}

impl DeploymentChange {
    fn new(event_type: EventType, key: String, deployment: Option<&Deployment>) -> Self {
        let status = deployment.and_then(|d| d.status.as_ref());
        Self {
            event_type,
            key,
            replicas: status.and_then(|s| s.replicas).unwrap_or_default(),
            available: status.and_then(|s| s.available_replicas).unwrap_or_default(),
        }
    }
}

/// Turns raw watch events into creates, updates and deletes.
///
/// A re-list reports every object again; keys seen before come out as
/// updates, and keys the re-list no longer contains come out as deletes.
#[derive(Debug, Default)]
pub struct DeploymentTracker {
    known: HashSet<String>,
    relist: Option<HashSet<String>>,
}

impl DeploymentTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: watcher::Event<Deployment>) -> Vec<DeploymentChange> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(deployment) => {
                let change = self.apply(&deployment);
                if let (Some(listed), Some(change)) = (self.relist.as_mut(), change.as_ref()) {
                    listed.insert(change.key.clone());
                }
                change.into_iter().collect()
            }
            watcher::Event::InitDone => {
                let listed = self.relist.take().unwrap_or_default();
                let gone: BTreeSet<String> = self.known.difference(&listed).cloned().collect();
                self.known = listed;
                gone.into_iter()
                    .map(|key| DeploymentChange::new(EventType::Delete, key, None))
                    .collect()
            }
            watcher::Event::Apply(deployment) => self.apply(&deployment).into_iter().collect(),
            watcher::Event::Delete(deployment) => {
                let Some(key) = object_key(&deployment.metadata) else {
                    return Vec::new();
                };
                self.known.remove(&key);
                vec![DeploymentChange::new(EventType::Delete, key, Some(&deployment))]
            }
        }
    }

    fn apply(&mut self, deployment: &Deployment) -> Option<DeploymentChange> {
        let Some(key) = object_key(&deployment.metadata) else {
            warn!("ignoring deployment without a name");
            return None;
        };
        let event_type = if self.known.insert(key.clone()) {
            EventType::Create
        } else {
            EventType::Update
        };
        Some(DeploymentChange::new(event_type, key, Some(deployment)))
    }
}

/// Logs every Deployment change from `source` until `stop` fires or the watch
/// ends. Returns how many changes were logged.
pub async fn log_deployment_events(
    mut source: DeploymentEventStream,
    namespace: &str,
    stop: CancellationToken,
) -> Result<u64, ServerError> {
    info!(namespace = %namespace, "watching deployments");
    let mut tracker = DeploymentTracker::new();
    let mut logged = 0;

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = source.next() => match next {
                Some(Ok(event)) => {
                    for change in tracker.handle(event) {
                        info!(
                            key = %change.key,
                            event_type = %change.event_type,
                            replicas = change.replicas,
                            available = change.available,
                            "deployment event"
                        );
                        logged += 1;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "deployment watch error, watcher will retry"),
                None => {
                    debug!("deployment watch stream ended");
                    break;
                }
            },
        }
    }

    info!(logged, "deployment watch stopped");
    Ok(logged)
}
