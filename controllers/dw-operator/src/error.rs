//! Error types for the DwOperator controller.

use kube::Error as KubeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Status or patch body could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A resource lacks a field reconciliation depends on
    #[error("{kind} is missing {field}")]
    MissingField { kind: &'static str, field: &'static str },

    /// A watcher task ended abnormally
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
