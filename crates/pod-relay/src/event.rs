//! Canonical events and status records.
//!
//! The cache produces [`Event`]s, the queue coalesces them by key and the
//! controller turns each processed event into a [`StatusRecord`] that is
//! fanned out to subscribers.

use k8s_openapi::api::core::v1::Pod;
use std::fmt;

/// Resource type tag carried by every pod event.
pub const POD_RESOURCE: &str = "pod";

/// Kind of change observed for a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Object appeared in the cache
    Create,
    /// Object changed, or was re-delivered by a resync
    Update,
    /// Object left the cache
    Delete,
}

impl EventType {
    /// Wire name used in status records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }

    /// Merges a newer event type into one that is still pending.
    ///
    /// A pending create absorbs later updates so subscribers still learn the
    /// object is new; anything else is superseded by the newer type.
    #[must_use]
    pub fn coalesce(self, newer: EventType) -> EventType {
        match (self, newer) {
            (EventType::Create, EventType::Update) => EventType::Create,
            (_, newer) => newer,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical unit of work handed from the cache to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    /// `namespace/name` key of the object
    pub key: String,
    /// What happened to it
    pub event_type: EventType,
    /// Resource type tag, e.g. [`POD_RESOURCE`]
    pub resource_type: &'static str,
}

impl Event {
    /// Creates a pod event.
    pub fn pod(key: impl Into<String>, event_type: EventType) -> Self {
        Self {
            key: key.into(),
            event_type,
            resource_type: POD_RESOURCE,
        }
    }
}

/// Items the rate-limited queue can hold.
///
/// Two items with the same key are the same unit of work; while one is
/// pending, adding the other merges into it instead of queueing twice.
pub trait QueueItem: Clone + Send + Sync + 'static {
    /// Deduplication key.
    fn queue_key(&self) -> &str;

    /// Merges a newer item for the same key into this pending one.
    fn merge(&mut self, newer: Self);
}

impl QueueItem for Event {
    fn queue_key(&self) -> &str {
        &self.key
    }

    fn merge(&mut self, newer: Self) {
        self.event_type = self.event_type.coalesce(newer.event_type);
    }
}

/// Returns the `namespace/name` key of an object, or just `name` for
/// cluster-scoped objects. `None` if the object has no name.
#[must_use]
pub fn object_key(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref()?;
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => Some(format!("{ns}/{name}")),
        _ => Some(name.to_string()),
    }
}

/// Status of one pod as relayed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    /// Event type that produced this record
    pub message: EventType,
    /// Pod phase (`Pending`, `Running`, ...)
    pub pod_state: String,
    /// Pod IP, empty until assigned
    pub pod_ip: String,
    /// `spec.nodeName` once the pod is bound; until then the scheduler's
    /// `status.nominatedNodeName`, or empty
    pub node_name: String,
    /// Pod name
    pub pod_name: String,
    /// IP of the hosting node
    pub host_ip: String,
}

impl StatusRecord {
    /// Builds a record from the cached pod snapshot.
    #[must_use]
    pub fn from_pod(message: EventType, pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .filter(|name| !name.is_empty())
            .or_else(|| status.and_then(|s| s.nominated_node_name.clone()))
            .unwrap_or_default();

        Self {
            message,
            pod_state: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
            pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            node_name,
            pod_name: pod.metadata.name.clone().unwrap_or_default(),
            host_ip: status.and_then(|s| s.host_ip.clone()).unwrap_or_default(),
        }
    }
}
