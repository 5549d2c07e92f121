//! Status subresource management for PostgresCluster resources
//!
//! The status is composed purely from the outcome of a pass and written only
//! when it differs from what is stored. Writes carry the resourceVersion the
//! pass started from, so a concurrent writer makes the patch fail with a
//! conflict instead of silently overwriting the switch record.

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::controller::Context;
use crate::controller::condition::{ConditionReporter, SwitchOutcome, condition_applies};
use crate::controller::error::Result;
use crate::controller::switchover::PassOutcome;
use crate::crd::{Condition, PostgresCluster, PostgresClusterStatus};

/// Field manager used for status writes
pub const FIELD_MANAGER: &str = "replica-switch-operator";

/// Compose the status a pass leaves behind
///
/// The switch condition is only touched for clusters it applies to; other
/// conditions on the resource are carried over untouched.
pub fn compose_status(
    cluster: &PostgresCluster,
    pass: &PassOutcome,
    now: DateTime<Utc>,
) -> PostgresClusterStatus {
    let conditions = existing_conditions(cluster, &pass.outcome, now);
    PostgresClusterStatus {
        switch: Some(pass.record.clone()),
        current_primary: pass.topology.current_primary().map(|p| p.to_string()),
        instance_names: pass
            .topology
            .instances()
            .iter()
            .map(|id| id.to_string())
            .collect(),
        ready_instances: i32::try_from(pass.topology.ready_instances()).unwrap_or(i32::MAX),
        observed_generation: cluster.metadata.generation,
        conditions,
    }
}

/// Compose the status for a pass that could not run
///
/// Everything but the switch condition stays as stored.
pub fn compose_failure(
    cluster: &PostgresCluster,
    outcome: &SwitchOutcome,
    now: DateTime<Utc>,
) -> PostgresClusterStatus {
    let mut status = cluster.status.clone().unwrap_or_default();
    status.conditions = existing_conditions(cluster, outcome, now);
    status.observed_generation = cluster.metadata.generation;
    status
}

fn existing_conditions(
    cluster: &PostgresCluster,
    outcome: &SwitchOutcome,
    now: DateTime<Utc>,
) -> Vec<Condition> {
    let existing = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    if !condition_applies(cluster) {
        return existing;
    }

    let mut reporter = ConditionReporter::from_existing(existing, cluster.metadata.generation);
    reporter.set_condition(outcome, now);
    reporter.build()
}

/// Whether persisting `next` would change the stored status
pub fn status_changed(current: Option<&PostgresClusterStatus>, next: &PostgresClusterStatus) -> bool {
    match current {
        Some(current) => current != next,
        None => true,
    }
}

/// Status manager for PostgresCluster resources
pub struct StatusManager<'a> {
    cluster: &'a PostgresCluster,
    ctx: &'a Context,
    ns: &'a str,
}

impl<'a> StatusManager<'a> {
    /// Create a new status manager
    pub fn new(cluster: &'a PostgresCluster, ctx: &'a Context, ns: &'a str) -> Self {
        Self { cluster, ctx, ns }
    }

    /// Persist `status` if it differs from the stored one
    ///
    /// Returns whether a write happened. A conflicting concurrent write
    /// surfaces as a 409 `KubeError`.
    pub async fn update(&self, status: PostgresClusterStatus) -> Result<bool> {
        let name = self.cluster.name_any();
        if !status_changed(self.cluster.status.as_ref(), &status) {
            debug!(name = %name, "Status unchanged, skipping write");
            return Ok(false);
        }

        let api: Api<PostgresCluster> = Api::namespaced(self.ctx.client.clone(), self.ns);
        let patch = status_patch(self.cluster.resource_version(), &status);

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(true)
    }
}

/// Merge patch body, guarded by the resourceVersion when one is known
///
/// Unset optional fields are sent as `null`, which removes them from the
/// stored status.
pub fn status_patch(
    resource_version: Option<String>,
    status: &PostgresClusterStatus,
) -> serde_json::Value {
    match resource_version {
        Some(version) => serde_json::json!({
            "metadata": { "resourceVersion": version },
            "status": status
        }),
        None => serde_json::json!({ "status": status }),
    }
}
