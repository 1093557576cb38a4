//! Reconciliation logic for DwOperator resources and the pods they own.
//!
//! Two loops share one [`Context`]:
//! - `reconcile_operator` keeps the named Deployment present and scaled, then
//!   publishes a status counted from its pods.
//! - `reconcile_pod` copies the node's topology zone onto each scheduled pod
//!   that does not carry one yet.

use crate::backoff::FailureTracker;
use crate::error::ControllerError;
use crds::{DwOperator, DwOperatorStatus};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Node, ObjectFieldSelector, Pod, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::Action;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label tying pods and the Deployment to the DwOperator that declared them.
pub const DEPLOYMENT_LABEL: &str = "demo.dw.io/deployment-name";
/// Zone label written onto pods.
pub const ZONE_LABEL: &str = "availability-zone";
/// Well-known node label the zone is read from.
pub const NODE_ZONE_LABEL: &str = "topology.kubernetes.io/zone";

const APP_LABEL: &str = "k8s-app";
const APP_NAME: &str = "dw-server";
const CONTAINER_NAME: &str = "dwdeployment";
const CONTAINER_IMAGE: &str = "bobbyho/dwserver:latest";
const CONTAINER_COMMAND: [&str; 3] = ["dwserver", "pod-controller", "watch-endpoints"];

/// How often a healthy DwOperator is revisited to refresh its status.
const STATUS_REFRESH: Duration = Duration::from_secs(30);

/// Shared state for both reconcile loops.
pub struct Context {
    client: Client,
    pub failures: FailureTracker,
}

impl Context {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            failures: FailureTracker::new(Duration::from_secs(5), Duration::from_secs(300)),
        }
    }
}

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Node a pod has been bound to, if the scheduler has placed it.
#[must_use]
pub fn scheduled_node(pod: &Pod) -> Option<&str> {
    let scheduled = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "PodScheduled" && c.status == "True")
        });
    if !scheduled {
        return None;
    }
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|node| !node.is_empty())
}

/// Zone recorded on the pod, ignoring an empty label.
#[must_use]
pub fn pod_zone(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ZONE_LABEL))
        .map(String::as_str)
        .filter(|zone| !zone.is_empty())
}

/// Merge patch that sets the pod's zone label.
#[must_use]
pub fn zone_label_patch(zone: &str) -> serde_json::Value {
    json!({ "metadata": { "labels": { ZONE_LABEL: zone } } })
}

fn pod_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (DEPLOYMENT_LABEL.to_string(), deployment_name.to_string()),
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (ZONE_LABEL.to_string(), String::new()),
    ])
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deployment declared by `op`.
///
/// The Deployment is owned by the DwOperator when both live in the same
/// namespace; owner references cannot cross namespaces.
pub fn build_deployment(op: &DwOperator) -> Result<Deployment, ControllerError> {
    let namespace = op.target_namespace().ok_or(ControllerError::MissingField {
        kind: "DwOperator",
        field: "namespace",
    })?;
    let name = op.spec.name.as_str();
    if name.is_empty() {
        return Err(ControllerError::MissingField {
            kind: "DwOperator",
            field: "spec.name",
        });
    }

    let owner_references = if op.metadata.namespace.as_deref() == Some(namespace) {
        op.controller_owner_ref(&()).map(|owner| vec![owner])
    } else {
        None
    };

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(CONTAINER_IMAGE.to_string()),
        command: Some(CONTAINER_COMMAND.iter().map(ToString::to_string).collect()),
        env: Some(vec![
            downward_env("POD_IP", "status.podIP"),
            downward_env("POD_NAME", "metadata.name"),
            downward_env("NODE_NAME", "spec.nodeName"),
            downward_env("NAMESPACE", "metadata.namespace"),
            downward_env("AVAILABILITY_ZONE", "metadata.labels['availability-zone']"),
        ]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references,
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(op.desired_replicas()),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    DEPLOYMENT_LABEL.to_string(),
                    name.to_string(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Counts scheduled and running pods, bucketing running pods by zone.
/// Running pods without a zone label are counted in the total only.
#[must_use]
pub fn summarize_pods(pods: &[Pod]) -> DwOperatorStatus {
    let mut status = DwOperatorStatus::default();
    for pod in pods {
        if scheduled_node(pod).is_some() {
            status.total_scheduled += 1;
        }
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Running");
        if !running {
            continue;
        }
        status.total_running += 1;
        if let Some(zone) = pod_zone(pod) {
            *status.zone_running.entry(zone.to_string()).or_insert(0) += 1;
        }
    }
    status
}

/// Creates or scales the Deployment declared by `op` and refreshes its status.
pub async fn reconcile_operator(
    op: Arc<DwOperator>,
    ctx: Arc<Context>,
) -> Result<Action, ControllerError> {
    let desired = build_deployment(&op)?;
    let namespace = desired.metadata.namespace.clone().unwrap_or_default();
    let name = op.spec.name.clone();
    let replicas = op.desired_replicas();

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    match deployments.get_opt(&name).await? {
        None => {
            info!("Creating Deployment {}/{} for {}", namespace, name, object_key(op.as_ref()));
            deployments.create(&PostParams::default(), &desired).await?;
        }
        Some(existing) => {
            let current = existing.spec.as_ref().and_then(|s| s.replicas);
            if current != Some(replicas) {
                info!(
                    "Scaling Deployment {}/{} from {:?} to {} replicas",
                    namespace, name, current, replicas
                );
                let patch = json!({ "spec": { "replicas": replicas } });
                deployments
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
        }
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{DEPLOYMENT_LABEL}={name}");
    let listed = pods.list(&ListParams::default().labels(&selector)).await?;
    let status = summarize_pods(&listed.items);

    if op.status.as_ref() != Some(&status) {
        let own_namespace = op.namespace().ok_or(ControllerError::MissingField {
            kind: "DwOperator",
            field: "metadata.namespace",
        })?;
        let operators: Api<DwOperator> = Api::namespaced(ctx.client.clone(), &own_namespace);
        let patch = json!({ "status": serde_json::to_value(&status)? });
        operators
            .patch_status(&op.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(
            "Updated {} status: {} scheduled, {} running",
            object_key(op.as_ref()),
            status.total_scheduled,
            status.total_running
        );
    }

    Ok(Action::requeue(STATUS_REFRESH))
}

/// Labels a scheduled pod with its node's zone.
pub async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    if pod_zone(&pod).is_some() {
        return Ok(Action::await_change());
    }
    let Some(node_name) = scheduled_node(&pod) else {
        debug!("Pod {} is not scheduled yet", object_key(pod.as_ref()));
        return Ok(Action::await_change());
    };

    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let Some(node) = nodes.get_opt(node_name).await? else {
        debug!("Node {} of pod {} no longer exists", node_name, object_key(pod.as_ref()));
        return Ok(Action::await_change());
    };
    let Some(zone) = node.labels().get(NODE_ZONE_LABEL).filter(|z| !z.is_empty()) else {
        warn!("Node {} has no {} label", node_name, NODE_ZONE_LABEL);
        return Ok(Action::await_change());
    };

    let namespace = pod.namespace().ok_or(ControllerError::MissingField {
        kind: "Pod",
        field: "metadata.namespace",
    })?;
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    pods.patch(
        &pod.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&zone_label_patch(zone)),
    )
    .await?;
    info!("Labelled pod {} with zone {}", object_key(pod.as_ref()), zone);

    Ok(Action::await_change())
}
