//! Command-line and environment configuration.

use crate::error::ServerError;
use clap::{Parser, ValueEnum};
use pod_relay::{BackpressurePolicy, RelayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "pod-status",
    version,
    about = "Relays pod lifecycle changes to gRPC subscribers"
)]
pub struct Cli {
    /// Namespace whose pods are watched
    #[arg(short = 'n', long, env = "WATCH_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// gRPC listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:50051")]
    pub listen_addr: SocketAddr,

    /// Health and metrics listen address
    #[arg(long, env = "PROBE_ADDR", default_value = "0.0.0.0:8080")]
    pub probe_addr: SocketAddr,

    /// Explicit kubeconfig file (default: in-cluster config or $KUBECONFIG)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Seconds between full cache resyncs
    #[arg(long, env = "RESYNC_SECONDS", default_value_t = 30)]
    pub resync_seconds: u64,

    /// Seconds to wait for the initial pod list
    #[arg(long, env = "SYNC_TIMEOUT_SECONDS", default_value_t = 60)]
    pub sync_timeout_seconds: u64,

    /// Concurrent queue workers
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Records buffered per subscriber
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 1)]
    pub channel_capacity: usize,

    /// What to do when a subscriber falls behind
    #[arg(long, env = "BACKPRESSURE", value_enum, default_value_t = BackpressureArg::Block)]
    pub backpressure: BackpressureArg,

    /// Give up on a pod event after this many retries (default: never)
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Seconds in-flight work may take to finish on shutdown
    #[arg(long, env = "DRAIN_TIMEOUT_SECONDS", default_value_t = 10)]
    pub drain_timeout_seconds: u64,

    /// Only watch pods and log each event; do not serve gRPC
    #[arg(long, default_value_t = false)]
    pub watch_only: bool,

    /// Only watch deployments and log each change; do not serve gRPC
    #[arg(long, default_value_t = false, conflicts_with = "watch_only")]
    pub watch_deployments: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum BackpressureArg {
    /// Stall the broadcast until the subscriber catches up
    Block,
    /// Evict the subscriber's oldest undelivered record
    DropOldest,
}

impl From<BackpressureArg> for BackpressurePolicy {
    fn from(v: BackpressureArg) -> Self {
        match v {
            BackpressureArg::Block => BackpressurePolicy::Block,
            BackpressureArg::DropOldest => BackpressurePolicy::DropOldest,
        }
    }
}

/// Validated server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// gRPC listen address
    pub listen_addr: SocketAddr,
    /// Health and metrics listen address
    pub probe_addr: SocketAddr,
    /// Explicit kubeconfig path, if any
    pub kubeconfig: Option<PathBuf>,
    /// Log pod events instead of serving
    pub watch_only: bool,
    /// Log deployment changes instead of serving
    pub watch_deployments: bool,
    /// Settings for the relay pipeline
    pub relay: RelayConfig,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ServerError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let relay = RelayConfig {
            namespace: cli.namespace,
            resync_period: Duration::from_secs(cli.resync_seconds),
            sync_timeout: Duration::from_secs(cli.sync_timeout_seconds),
            workers: cli.workers,
            channel_capacity: cli.channel_capacity,
            backpressure: cli.backpressure.into(),
            max_retries: cli.max_retries,
            drain_timeout: Duration::from_secs(cli.drain_timeout_seconds),
            ..RelayConfig::default()
        };
        relay
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;

        if cli.listen_addr == cli.probe_addr && cli.listen_addr.port() != 0 {
            return Err(ServerError::InvalidConfig(format!(
                "gRPC and probe servers cannot share {}",
                cli.listen_addr
            )));
        }

        Ok(Self {
            listen_addr: cli.listen_addr,
            probe_addr: cli.probe_addr,
            kubeconfig: cli.kubeconfig,
            watch_only: cli.watch_only,
            watch_deployments: cli.watch_deployments,
            relay,
        })
    }
}
