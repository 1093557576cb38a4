//! Error types for the pod status server.

use pod_relay::RelayError;
use thiserror::Error;

/// Errors that can end the server process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Relay pipeline error, including a failed cache sync
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig could not be loaded
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// gRPC transport error
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Socket or other IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A server task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
