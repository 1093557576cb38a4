//! Watch-to-relay pipeline for Kubernetes pods.
//!
//! A [`PodCache`] mirrors the pods of one namespace and feeds canonical
//! [`Event`]s into a deduplicating [`RateLimitingQueue`]. The
//! [`PodController`] drains the queue, resolves each key back to the cached
//! pod and broadcasts a [`StatusRecord`] to every channel in its
//! [`SubscriberRegistry`].
//!
//! ```text
//! watch → PodCache → Event → RateLimitingQueue → PodController
//!       → StatusRecord → SubscriberRegistry → per-client Subscription
//! ```

pub mod backoff;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod metrics;
pub mod queue;
pub mod registry;

pub use backoff::ItemExponentialBackoff;
pub use cache::{PodCache, PodEventStream};
pub use config::RelayConfig;
pub use controller::{ControllerState, PodController};
pub use error::RelayError;
pub use event::{Event, EventType, QueueItem, StatusRecord, object_key};
pub use metrics::RelayMetrics;
pub use queue::RateLimitingQueue;
pub use registry::{BackpressurePolicy, SubscriberRegistry, Subscription};
