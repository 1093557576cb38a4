//! Kubernetes resource watchers.
//!
//! Every watcher goes through `watch_resource()`, which drives a
//! kube_runtime `Controller` and applies the shared Fibonacci requeue policy.

use crate::error::ControllerError;
use crate::reconciler::{object_key, Context};
use futures::StreamExt;
use kube::Resource;
use kube_runtime::Controller;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Runs `controller` until it shuts down, reconciling each object with
/// `reconcile_fn`.
///
/// A failed object is requeued after a delay that grows with its consecutive
/// failures; a clean reconcile clears the count.
pub async fn watch_resource<K, F, Fut>(
    controller: Controller<K>,
    ctx: Arc<Context>,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
    F: Fn(Arc<K>, Arc<Context>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Action, ControllerError>> + Send + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Context>| {
        let key = object_key(obj.as_ref());
        let delay = ctx.failures.record_failure(&key);
        warn!(
            "Reconciliation error for {} {}: {}; retrying in {:?}",
            resource_name, key, error, delay
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Context>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = object_key(obj.as_ref());
            debug!("Reconciling {} {}", resource_name, key);
            let action = reconcile_fn(obj, Arc::clone(&ctx)).await?;
            ctx.failures.reset(&key);
            Ok::<_, ControllerError>(action)
        }
    };

    // Debounce batches bursts of pod and status churn into one reconcile
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(3);

    controller
        .with_config(controller_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", resource_name, obj),
                Err(e) => error!("Controller error for {}: {}", resource_name, e),
            }
        })
        .await;

    info!("{} watcher stopped", resource_name);
    Ok(())
}
