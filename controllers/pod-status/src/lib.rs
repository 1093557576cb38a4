//! Pod Status Relay server.
//!
//! Watches the pods of one namespace and streams their lifecycle changes to
//! gRPC subscribers over `PodStatIntf`, with health and Prometheus endpoints
//! on a separate port.

pub mod bot;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod server;
pub mod shutdown;
pub mod watch;

/// Generated `podstat` protobuf types and gRPC stubs.
pub mod proto {
    #![allow(missing_docs)]
    tonic::include_proto!("podstat");
}

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::shutdown::Shutdown;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};
use pod_relay::{PodCache, PodController};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Builds a client from `kubeconfig`, or from the in-cluster / `$KUBECONFIG`
/// defaults when no path is given.
pub async fn make_client(kubeconfig: Option<&Path>) -> Result<Client, ServerError> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(Client::try_from(config)?)
}

/// Runs `fut` and cancels `token` if it fails, so one component going down
/// takes the others with it instead of leaving them serving.
pub async fn cancel_on_exit<E: std::fmt::Display>(
    fut: impl Future<Output = Result<(), E>>,
    token: &CancellationToken,
    component: &'static str,
) -> Result<(), E> {
    let result = fut.await;
    if let Err(e) = &result {
        error!(component, error = %e, "component failed, shutting down");
        token.cancel();
    }
    result
}

/// Runs the controller and both servers side by side until `shutdown` fires
/// or one of them fails.
///
/// Every component is awaited together, so a server that dies on its own is
/// noticed at once. Errors are reported in the order controller, gRPC, probes.
pub async fn serve_relay(
    controller: Arc<PodController>,
    grpc_listener: TcpListener,
    probe_listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let relay = cancel_on_exit(
        async {
            let result = Arc::clone(&controller).run(shutdown.clone()).await;
            // Whatever ended the controller also ends the servers
            shutdown.cancel();
            result
        },
        &shutdown,
        "pod controller",
    );
    let grpc = cancel_on_exit(
        server::serve(Arc::clone(&controller), grpc_listener, shutdown.clone()),
        &shutdown,
        "gRPC server",
    );
    let probes = cancel_on_exit(
        health::serve(Arc::clone(&controller), probe_listener, shutdown.clone()),
        &shutdown,
        "probe server",
    );

    let (relay, grpc, probes) = tokio::join!(relay, grpc, probes);
    relay?;
    grpc?;
    probes?;
    Ok(())
}

/// Runs the server until SIGINT/SIGTERM, or until the controller fails to
/// sync.
pub async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let client = make_client(config.kubeconfig.as_deref()).await?;

    let shutdown = Shutdown::new();
    let signals = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    if config.watch_only {
        let source = PodCache::watch_stream(client, &config.relay.namespace);
        watch::log_events(source, &config.relay, shutdown.token()).await?;
        signals.abort();
        return Ok(());
    }

    if config.watch_deployments {
        let source = watch::deployment_watch_stream(client, &config.relay.namespace);
        watch::log_deployment_events(source, &config.relay.namespace, shutdown.token()).await?;
        signals.abort();
        return Ok(());
    }

    let controller = PodController::for_namespace(client, config.relay.clone())?;
    let grpc_listener = TcpListener::bind(config.listen_addr).await?;
    let probe_listener = TcpListener::bind(config.probe_addr).await?;

    let result = serve_relay(controller, grpc_listener, probe_listener, shutdown.token()).await;
    signals.abort();
    result?;

    info!("Bye");
    Ok(())
}
