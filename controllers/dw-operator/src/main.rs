//! DwOperator Controller
//!
//! Keeps the Deployment declared by each DwOperator present and scaled,
//! publishes per-zone pod counts in its status, and labels every scheduled
//! dw-server pod with the topology zone of its node.

mod backoff;
mod controller;
mod error;
mod reconciler;
mod watcher;

use crate::error::ControllerError;
use controller::Controller;
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt::init();

    info!("Starting DwOperator Controller");

    let namespace = env::var("WATCH_NAMESPACE").ok().filter(|ns| !ns.is_empty());
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));

    let controller = Controller::new(namespace).await?;
    controller.run().await?;

    Ok(())
}
