//! Pipeline error types.
//!
//! Errors are grouped by how far they reach: sync failures end a
//! controller instance, stale keys are retried through the queue, and
//! everything else stays local to the task that hit it.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the watch-to-relay pipeline.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The cache did not finish its initial list within the sync timeout
    #[error("timed out after {0:?} waiting for the pod cache to sync")]
    SyncTimeout(Duration),

    /// The stop signal fired before the cache finished its initial list
    #[error("stop signal received before the pod cache synced")]
    SyncAborted,

    /// The cache was read before its initial list landed
    #[error("pod cache has not synced yet")]
    NotSynced,

    /// A dequeued key no longer exists in the cache
    #[error("object with key {0} no longer exists in the pod cache")]
    StaleKey(String),

    /// `run` was called on a controller that already consumed its watch source
    #[error("controller has already been started")]
    AlreadyStarted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
