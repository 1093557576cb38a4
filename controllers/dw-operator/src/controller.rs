//! Main controller implementation.
//!
//! Wires the DwOperator and pod watchers to one reconcile [`Context`] and
//! runs them until a termination signal arrives.

use crate::error::ControllerError;
use crate::reconciler::{self, Context, DEPLOYMENT_LABEL};
use crate::watcher::watch_resource;
use crds::DwOperator;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::{Controller as RuntimeController, watcher};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Main controller for DwOperator resources.
pub struct Controller {
    operator_watcher: JoinHandle<Result<(), ControllerError>>,
    pod_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Connects to the cluster and starts both watchers. `None` watches every
    /// namespace.
    pub async fn new(namespace: Option<String>) -> Result<Self, ControllerError> {
        info!("Initializing DwOperator controller");
        let client = Client::try_default().await?;
        let ns = namespace.as_deref();
        let ctx = Arc::new(Context::new(client.clone()));

        let operators: Api<DwOperator> = scoped(client.clone(), ns);
        let deployments: Api<Deployment> = scoped(client.clone(), ns);
        let pods: Api<Pod> = scoped(client, ns);

        let operator_controller = RuntimeController::new(operators, watcher::Config::default())
            .owns(deployments, watcher::Config::default())
            .shutdown_on_signal();
        // Only pods stamped by a DwOperator Deployment are zone-labelled
        let pod_controller =
            RuntimeController::new(pods, watcher::Config::default().labels(DEPLOYMENT_LABEL))
                .shutdown_on_signal();

        let operator_watcher = tokio::spawn(watch_resource(
            operator_controller,
            Arc::clone(&ctx),
            reconciler::reconcile_operator,
            "DwOperator",
        ));
        let pod_watcher = tokio::spawn(watch_resource(
            pod_controller,
            ctx,
            reconciler::reconcile_pod,
            "Pod",
        ));

        Ok(Self {
            operator_watcher,
            pod_watcher,
        })
    }

    /// Waits for both watchers to stop.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("DwOperator controller running");
        let (operators, pods) = tokio::join!(self.operator_watcher, self.pod_watcher);
        for (name, joined) in [("DwOperator", operators), ("Pod", pods)] {
            match joined {
                Ok(result) => result?,
                Err(e) => {
                    error!("{} watcher task failed: {}", name, e);
                    return Err(ControllerError::Watch(e.to_string()));
                }
            }
        }
        info!("DwOperator controller stopped");
        Ok(())
    }
}
