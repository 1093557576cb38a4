//! `PodStatIntf` gRPC service.
//!
//! `ListenPodStatus` opens the caller's subscriber channel and hands back a
//! response stream that reads straight from it. Nothing sits between the two,
//! so a client that stops reading fills its own channel and no more. Whoever
//! drops the stream (tonic on disconnect, or the stream ending on shutdown)
//! closes the channel and removes it from the registry.

use crate::error::ServerError;
use crate::proto::pod_stat_intf_server::{PodStatIntf, PodStatIntfServer};
use crate::proto::{PodStat, PodStatReply, PodStatRequest};
use futures::Stream;
use pod_relay::{PodController, RelayError, StatusRecord, Subscription};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

type ReplyStream = Pin<Box<dyn Stream<Item = Result<PodStatReply, Status>> + Send>>;

impl From<StatusRecord> for PodStatReply {
    fn from(record: StatusRecord) -> Self {
        Self {
            message: record.message.as_str().to_string(),
            podstat: Some(PodStat {
                podstate: record.pod_state,
                podip: record.pod_ip,
                nodename: record.node_name,
                podname: record.pod_name,
                hostip: record.host_ip,
            }),
        }
    }
}

fn to_status(err: &RelayError) -> Status {
    match err {
        RelayError::NotSynced => Status::unavailable(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

/// How a subscriber stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeExit {
    /// The process is shutting down
    Shutdown,
    /// The client cancelled or disconnected
    ClientGone,
    /// The subscriber channel was closed underneath the stream
    ChannelClosed,
}

/// Owns a subscription for the lifetime of its response stream.
struct BridgeGuard {
    controller: Arc<PodController>,
    subscription: Subscription,
    shutdown: CancellationToken,
    exit: BridgeExit,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        // Close our end first so a broadcast stalled on this channel lets go of
        // the registry lock before close_channel asks for it exclusively
        self.subscription.close();

        let client_id = self.subscription.client_id().to_string();
        info!(client_id = %client_id, reason = ?self.exit, "client unsubscribed");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let controller = Arc::clone(&self.controller);
            handle.spawn(async move {
                controller.close_channel(&client_id).await;
            });
        }
    }
}

/// Turns `subscription` into a response stream.
///
/// A record is taken off the channel only when the client polls for it. The
/// stream ends when `shutdown` fires or the channel is closed; dropping it
/// early counts as the client going away.
pub fn bridge(controller: Arc<PodController>, subscription: Subscription, shutdown: CancellationToken) -> ReplyStream {
    info!(client_id = %subscription.client_id(), "client subscribed");
    let guard = BridgeGuard {
        controller,
        subscription,
        shutdown,
        exit: BridgeExit::ClientGone,
    };

    Box::pin(futures::stream::unfold(guard, |mut guard| async move {
        let next = tokio::select! {
            biased;
            () = guard.shutdown.cancelled() => Err(BridgeExit::Shutdown),
            record = guard.subscription.recv() => record.ok_or(BridgeExit::ChannelClosed),
        };
        match next {
            Ok(record) => {
                debug!(
                    client_id = %guard.subscription.client_id(),
                    pod = %record.pod_name,
                    message = %record.message,
                    "forwarding pod status"
                );
                Some((Ok(record.into()), guard))
            }
            Err(exit) => {
                guard.exit = exit;
                None
            }
        }
    }))
}

/// gRPC front end for a [`PodController`].
#[derive(Debug, Clone)]
pub struct PodStatusService {
    controller: Arc<PodController>,
    shutdown: CancellationToken,
}

impl PodStatusService {
    #[must_use]
    pub fn new(controller: Arc<PodController>, shutdown: CancellationToken) -> Self {
        Self { controller, shutdown }
    }

    /// Cache key for a request name: bare names live in the watched namespace.
    fn key_for(&self, name: &str) -> String {
        if name.contains('/') {
            name.to_string()
        } else {
            format!("{}/{}", self.controller.config().namespace, name)
        }
    }
}

#[tonic::async_trait]
impl PodStatIntf for PodStatusService {
    type ListenPodStatusStream = ReplyStream;

    async fn listen_pod_status(
        &self,
        request: Request<PodStatRequest>,
    ) -> Result<Response<Self::ListenPodStatusStream>, Status> {
        let client_id = request.into_inner().clientid;
        if client_id.is_empty() {
            return Err(Status::invalid_argument("clientid must not be empty"));
        }

        let subscription = self.controller.open_channel(&client_id).await;
        Ok(Response::new(bridge(
            Arc::clone(&self.controller),
            subscription,
            self.shutdown.clone(),
        )))
    }

    type GetAllPodStatusStream = ReplyStream;

    async fn get_all_pod_status(
        &self,
        request: Request<PodStatRequest>,
    ) -> Result<Response<Self::GetAllPodStatusStream>, Status> {
        let snapshot = self.controller.snapshot().map_err(|e| to_status(&e))?;
        debug!(client_id = %request.get_ref().clientid, pods = snapshot.len(), "serving pod snapshot");

        let replies: Vec<Result<PodStatReply, Status>> =
            snapshot.into_iter().map(|record| Ok(record.into())).collect();
        Ok(Response::new(Box::pin(tokio_stream::iter(replies))))
    }

    async fn get_pod_status_by_name(
        &self,
        request: Request<PodStatRequest>,
    ) -> Result<Response<PodStatReply>, Status> {
        let name = request.into_inner().name;
        if name.is_empty() {
            return Err(Status::invalid_argument("name must not be empty"));
        }

        let key = self.key_for(&name);
        match self.controller.status_by_key(&key).map_err(|e| to_status(&e))? {
            Some(record) => Ok(Response::new(record.into())),
            None => Err(Status::not_found(format!("pod {key} not found"))),
        }
    }
}

/// Serves `PodStatIntf` on `listener` until `shutdown` fires.
pub async fn serve(
    controller: Arc<PodController>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    let service = PodStatusService::new(controller, shutdown.clone());
    info!(%addr, "gRPC server listening");

    tonic::transport::Server::builder()
        .add_service(PodStatIntfServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await;
            info!("shutting down gRPC server");
        })
        .await?;
    Ok(())
}
