pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod topology;

pub use config::{ConfigError, OperatorConfig, SwitchoverConfig};
pub use controller::{BackoffConfig, Context, Error, Result, error_policy, reconcile};
pub use crd::PostgresCluster;
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::crd::CLUSTER_LABEL;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Map an instance pod to the PostgresCluster named by its cluster label
fn cluster_for_pod(pod: &Pod) -> Option<ObjectRef<PostgresCluster>> {
    let cluster = pod.labels().get(CLUSTER_LABEL)?;
    let ns = pod.namespace()?;
    Some(ObjectRef::new(cluster).within(&ns))
}

/// Run the switchover controller, scoped by `config.watch_namespace`.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    reporter_instance: Option<String>,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    run_controller_scoped(
        client,
        config,
        reporter_instance,
        health_state,
        namespace.as_deref(),
    )
    .await
}

/// Run the switchover controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
///
/// The kube runtime never reconciles the same cluster twice at once;
/// different clusters reconcile concurrently.
pub async fn run_controller_scoped(
    client: Client,
    config: OperatorConfig,
    reporter_instance: Option<String>,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting switchover controller for PostgresCluster resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(
        client.clone(),
        config,
        reporter_instance,
        health_state,
    ));

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);

    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();
    let pod_config = WatcherConfig::default().labels(CLUSTER_LABEL);

    // Instance pods are not owned by the cluster resource; map them by label
    Controller::new(clusters, watcher_config)
        .watches(pods, pod_config, |pod| cluster_for_pod(&pod))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Pod events can still arrive for a cluster that was just deleted
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}
