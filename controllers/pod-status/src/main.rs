//! Pod Status Relay
//!
//! Streams the lifecycle of the pods in one namespace to gRPC subscribers.

use clap::Parser;
use pod_status::config::{Cli, ServerConfig};
use pod_status::error::ServerError;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    pod_status::logging::init();

    let config = ServerConfig::try_from(Cli::parse())?;

    info!("Starting Pod Status Relay");
    info!("  Namespace: {}", config.relay.namespace);
    info!("  gRPC address: {}", config.listen_addr);
    info!("  Probe address: {}", config.probe_addr);
    info!("  Workers: {}", config.relay.workers);
    info!("  Backpressure: {:?}", config.relay.backpressure);

    pod_status::run(config).await
}
