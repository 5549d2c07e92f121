//! Reconciliation logic for PostgresCluster resources
//!
//! Each reconcile is one level-triggered switchover pass: list the
//! instance pods, observe them, run the pass, persist the status and
//! publish transition events. Everything the next pass needs lives in the
//! status subresource.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::condition::SwitchOutcome;
use crate::controller::context::Context;
use crate::controller::enforcer::StreamingSettings;
use crate::controller::error::{Error, Result};
use crate::controller::events::TransitionNotifier;
use crate::controller::status::{StatusManager, compose_failure, compose_status};
use crate::controller::switchover::{PassInput, PassOutcome, SwitchoverPass};
use crate::controller::validation::validate_spec;
use crate::crd::{CLUSTER_LABEL, PostgresCluster};
use crate::resources::instance::{
    InstanceCommander, InstanceError, InstanceResult, PostgresInstanceClient,
};
use crate::resources::postgres_client::PostgresClientError;
use crate::resources::source_credentials::fetch_source_credentials;
use crate::topology::{ClusterTopology, ExternalSource, InstanceId, ObservedReplication};

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = cluster.name_any();

    debug!("Reconciling PostgresCluster");

    let result = reconcile_switchover(&cluster, &ctx, &ns).await;

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
    }

    match &result {
        Ok(action) => debug!(?action, "Reconciliation completed"),
        Err(e) => error!(error = %e, "Reconciliation failed"),
    }
    result
}

/// Error policy for the controller with exponential backoff
///
/// The persisted attempt counter drives the delay, so backoff survives
/// operator restarts.
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let attempts = cluster
        .status
        .as_ref()
        .and_then(|s| s.switch.as_ref())
        .map(|s| s.attempts)
        .unwrap_or(0);

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_error(&cluster.namespace().unwrap_or_default(), &name);
    }

    let delay = ctx.config.error_backoff.delay_for_error(error, attempts);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?} awaiting corrected intent",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

async fn reconcile_switchover(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
) -> Result<Action> {
    let name = cluster.name_any();

    if let Err(e) = validate_spec(cluster) {
        return Err(report_failure(cluster, ctx, ns, e).await);
    }

    let members = list_members(ctx, ns, &name).await?;
    let instances: Vec<InstanceId> = members.iter().map(|m| m.id.clone()).collect();
    let ready: Vec<InstanceId> = members
        .iter()
        .filter(|m| m.ready)
        .map(|m| m.id.clone())
        .collect();

    let mut topology = match ClusterTopology::from_cluster(cluster, instances, ready.len()) {
        Ok(topology) => topology,
        Err(e) => return Err(report_failure(cluster, ctx, ns, e.into()).await),
    };
    let sources = match declared_sources(cluster, ctx, ns).await {
        Ok(sources) => sources,
        Err(e) => return Err(report_failure(cluster, ctx, ns, e).await),
    };
    if let Some(source) = topology
        .external_source()
        .and_then(|s| sources.get(s.name()))
    {
        topology.set_source_credentials(source.credentials().clone());
    }
    let settings = StreamingSettings::from_cluster(cluster)?;

    let commander = match PostgresInstanceClient::for_cluster(
        ctx.client.clone(),
        ns,
        &name,
        cluster.spec.port(),
        ctx.config.switchover.reconfiguration_timeout,
    )
    .await
    {
        Ok(commander) => commander,
        Err(e) => {
            let error = Error::TransientError(format!("instance credentials unavailable: {}", e));
            return Err(report_failure(cluster, ctx, ns, error).await);
        }
    };

    let previous = cluster.status.as_ref().and_then(|s| s.switch.clone());
    let mut input = PassInput::new(topology, previous, Utc::now());
    input.sources.extend(sources);

    for (id, observed) in observe_instances(&commander, ctx, &ready).await {
        input.observe(id, observed);
    }

    let pass = SwitchoverPass::new(&commander, &settings, &ctx.config)
        .run(input)
        .await;

    info!(
        phase = %pass.record.phase,
        primary = pass.topology.current_primary().map(InstanceId::as_str).unwrap_or("<none>"),
        drift = pass.drift,
        commands = pass.commands_issued,
        "Switchover pass finished"
    );

    let status = compose_status(cluster, &pass, Utc::now());
    StatusManager::new(cluster, ctx, ns).update(status).await?;

    publish(cluster, ctx, ns, &pass).await;

    match pass.error {
        Some(error) if !error.is_retryable() => Err(error),
        Some(error) => {
            warn!(error = %error, requeue = ?pass.requeue_after, "Switchover pass did not settle");
            Ok(Action::requeue(pass.requeue_after))
        }
        None => Ok(Action::requeue(pass.requeue_after)),
    }
}

/// Events and metrics for a pass whose status is persisted
async fn publish(cluster: &PostgresCluster, ctx: &Context, ns: &str, pass: &PassOutcome) {
    for event in &pass.events {
        ctx.notifier.notify(cluster, event).await;
        if let Some(health) = &ctx.health_state {
            health.metrics.record_switchover(event.kind.direction());
        }
    }

    if let Some(health) = &ctx.health_state {
        if let Some(error) = &pass.error {
            health.metrics.record_switch_failure(error.reason());
        }
        health.metrics.set_cluster_topology(
            ns,
            &cluster.name_any(),
            i64::try_from(pass.drift).unwrap_or(i64::MAX),
            i64::try_from(pass.topology.ready_instances()).unwrap_or(i64::MAX),
        );
    }
}

/// Surface a failure that prevented the pass from running
///
/// Returns the error so callers can hand it to the error policy.
async fn report_failure(cluster: &PostgresCluster, ctx: &Context, ns: &str, error: Error) -> Error {
    warn!(error = %error, reason = error.reason(), "Switchover pass could not run");

    let status = compose_failure(cluster, &SwitchOutcome::failed(&error), Utc::now());
    if let Err(e) = StatusManager::new(cluster, ctx, ns).update(status).await {
        warn!(error = %e, "Failed to record failure on status");
    }
    if let Some(health) = &ctx.health_state {
        health.metrics.record_switch_failure(error.reason());
    }
    error
}

/// An instance pod of the cluster
struct Member {
    id: InstanceId,
    ready: bool,
}

/// List instance pods by cluster label
async fn list_members(ctx: &Context, ns: &str, cluster_name: &str) -> Result<Vec<Member>> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let selector = format!("{}={}", CLUSTER_LABEL, cluster_name);
    let list = pods.list(&ListParams::default().labels(&selector)).await?;

    let mut members: Vec<Member> = list
        .items
        .iter()
        .filter_map(|pod| {
            let name = pod.metadata.name.as_deref()?;
            Some(Member {
                id: InstanceId::from(name),
                ready: is_pod_ready(pod),
            })
        })
        .collect();
    members.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(members)
}

/// Pod Ready condition is True and the pod is not terminating
fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Observe ready instances concurrently; failures only cost the instance its health
async fn observe_instances<C: InstanceCommander>(
    commander: &C,
    ctx: &Context,
    ready: &[InstanceId],
) -> Vec<(InstanceId, ObservedReplication)> {
    let limit = ctx.config.switchover.reconfiguration_timeout;
    let results = join_all(ready.iter().map(|id| async move {
        let observed: InstanceResult<ObservedReplication> =
            match tokio::time::timeout(limit, commander.observe(id)).await {
                Ok(result) => result,
                Err(_) => Err(InstanceError::Unreachable(id.to_string())),
            };
        (id.clone(), observed)
    }))
    .await;

    results
        .into_iter()
        .filter_map(|(id, observed)| match observed {
            Ok(observed) => Some((id, observed)),
            Err(e) => {
                warn!(instance = %id, error = %e, "Instance observation failed");
                None
            }
        })
        .collect()
}

/// External clusters usable as a streaming source, by name, with credentials
///
/// Credentials of the declared replica source must resolve; other external
/// clusters whose secrets are unavailable are left out.
async fn declared_sources(
    cluster: &PostgresCluster,
    ctx: &Context,
    ns: &str,
) -> Result<BTreeMap<String, ExternalSource>> {
    let declared = cluster.spec.replica.as_ref().map(|r| r.source.as_str());
    let mut sources = BTreeMap::new();

    for external in &cluster.spec.external_clusters {
        let source = match ExternalSource::new(&external.name, external.connection_parameters.clone()) {
            Ok(source) => source,
            Err(e) => {
                debug!(source = %external.name, error = %e, "Skipping external cluster");
                continue;
            }
        };

        match fetch_source_credentials(&ctx.client, ns, external).await {
            Ok(credentials) => {
                sources.insert(external.name.clone(), source.with_credentials(credentials));
            }
            Err(e) if declared == Some(external.name.as_str()) => {
                return Err(credentials_error(&external.name, e));
            }
            Err(e) => {
                warn!(source = %external.name, error = %e, "Skipping external cluster without credentials");
            }
        }
    }
    Ok(sources)
}

/// Missing secrets wait for the owner; API failures are retried
fn credentials_error(source: &str, error: PostgresClientError) -> Error {
    let message = format!("credentials for external cluster {}: {}", source, error);
    match error {
        PostgresClientError::SecretNotFound(_)
        | PostgresClientError::SecretMissingKey(_)
        | PostgresClientError::InvalidUtf8 => Error::ConfigurationError(message),
        _ => Error::TransientError(message),
    }
}
