//! Streaming topology enforcement
//!
//! The plan is computed purely from the topology and the observations of the
//! current pass. Only followers with a missing desired edge are reconfigured;
//! an observed edge that is not desired is never torn down directly; it goes
//! away when its follower switches upstream.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::commands::{Command, CommandRunner};
use crate::controller::error::{Error, Result};
use crate::crd::PostgresCluster;
use crate::resources::instance::InstanceCommander;
use crate::topology::{
    ClusterTopology, Drift, InstanceAddressing, InstanceId, ObservedReplication, StreamingEdge,
    Upstream, classify_sender, desired_edges, observed_edges, render_conninfo,
};

/// How followers connect to an upstream member of the same cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingSettings {
    addressing: InstanceAddressing,
    replication_user: String,
    port: u16,
}

impl StreamingSettings {
    pub fn new(addressing: InstanceAddressing, replication_user: impl Into<String>, port: u16) -> Self {
        Self {
            addressing,
            replication_user: replication_user.into(),
            port,
        }
    }

    pub fn from_cluster(cluster: &PostgresCluster) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        Ok(Self::new(
            InstanceAddressing::new(cluster.name_any(), namespace),
            cluster.spec.replication_user(),
            cluster.spec.port(),
        ))
    }

    pub fn addressing(&self) -> &InstanceAddressing {
        &self.addressing
    }

    /// `primary_conninfo` the follower of `edge` needs
    ///
    /// `None` for an unresolved upstream, or an external edge on a cluster
    /// without a source.
    pub fn conninfo(&self, topology: &ClusterTopology, edge: &StreamingEdge) -> Option<String> {
        let application_name = edge.follower.as_str();
        match &edge.upstream {
            Upstream::External => topology
                .external_source()
                .map(|source| source.conninfo(application_name)),
            Upstream::Instance(upstream) => {
                let params = BTreeMap::from([
                    ("host".to_string(), self.addressing.host_for(upstream)),
                    ("port".to_string(), self.port.to_string()),
                    ("user".to_string(), self.replication_user.clone()),
                ]);
                Some(render_conninfo(&params, application_name))
            }
            Upstream::Unresolved(_) => None,
        }
    }
}

/// What one enforcement pass would change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementPlan {
    pub desired: BTreeSet<StreamingEdge>,
    pub observed: BTreeSet<StreamingEdge>,
    pub drift: Drift,
    /// Missing edges whose follower was observed and can be reconfigured
    pub reconfigurations: Vec<StreamingEdge>,
    /// Missing edges whose follower could not be observed on this pass
    pub deferred: Vec<StreamingEdge>,
    /// Unwanted edges with no replacing reconfiguration
    pub blocked: Vec<StreamingEdge>,
}

impl EnforcementPlan {
    pub fn compute(
        topology: &ClusterTopology,
        observations: &BTreeMap<InstanceId, ObservedReplication>,
        addressing: &InstanceAddressing,
    ) -> Self {
        let desired = desired_edges(topology);
        let observed = observed_edges(observations, topology, addressing);
        let drift = Drift::between(&desired, &observed);

        let (reconfigurations, deferred): (Vec<_>, Vec<_>) = drift
            .add
            .iter()
            .cloned()
            .partition(|edge| observations.contains_key(&edge.follower));

        let replaced: BTreeSet<&InstanceId> = drift.add.iter().map(|e| &e.follower).collect();
        let blocked = drift
            .remove
            .iter()
            .filter(|edge| !replaced.contains(&edge.follower))
            .cloned()
            .collect();

        Self {
            desired,
            observed,
            drift,
            reconfigurations,
            deferred,
            blocked,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.drift.is_empty()
    }
}

/// Result of applying an enforcement plan
#[derive(Debug, Default)]
pub struct EnforcementReport {
    /// Reconfigurations confirmed by the follower
    pub applied: Vec<StreamingEdge>,
    /// Reconfigurations that failed or were not confirmed in time
    pub unconfirmed: Vec<(StreamingEdge, Error)>,
    pub blocked: Vec<StreamingEdge>,
    pub deferred: Vec<StreamingEdge>,
    /// Drift size before enforcement
    pub drift: usize,
}

impl EnforcementReport {
    /// Drift that this pass could not repair, ignoring deferred followers
    pub fn remaining(&self) -> usize {
        self.unconfirmed.len() + self.blocked.len()
    }

    pub fn is_converged(&self) -> bool {
        self.remaining() == 0
    }
}

/// Applies enforcement plans through an `InstanceCommander`
pub struct StreamingEnforcer<'a, C> {
    runner: &'a CommandRunner<'a, C>,
    settings: &'a StreamingSettings,
}

impl<'a, C: InstanceCommander> StreamingEnforcer<'a, C> {
    pub fn new(runner: &'a CommandRunner<'a, C>, settings: &'a StreamingSettings) -> Self {
        Self { runner, settings }
    }

    /// Reconcile live wiring towards the desired edges
    ///
    /// A plan without drift issues no commands.
    pub async fn enforce(&self, topology: &ClusterTopology, plan: EnforcementPlan) -> EnforcementReport {
        let mut report = EnforcementReport {
            blocked: plan.blocked,
            deferred: plan.deferred,
            drift: plan.drift.len(),
            ..Default::default()
        };

        if plan.drift.is_empty() {
            return report;
        }

        for edge in &report.blocked {
            warn!(cluster = %topology.name(), edge = %edge, "Unwanted streaming edge has no replacement");
        }
        for edge in &report.deferred {
            debug!(cluster = %topology.name(), edge = %edge, "Deferring edge for unobserved follower");
        }

        let results = join_all(
            plan.reconfigurations
                .into_iter()
                .map(|edge| async move {
                    let result = self.apply(topology, &edge).await;
                    (edge, result)
                }),
        )
        .await;

        for (edge, result) in results {
            match result {
                Ok(()) => {
                    info!(cluster = %topology.name(), edge = %edge, "Streaming edge established");
                    report.applied.push(edge);
                }
                Err(error) => {
                    warn!(cluster = %topology.name(), edge = %edge, error = %error, "Streaming edge not confirmed");
                    report.unconfirmed.push((edge, error));
                }
            }
        }

        report
    }

    async fn apply(&self, topology: &ClusterTopology, edge: &StreamingEdge) -> Result<()> {
        let conninfo = self.settings.conninfo(topology, edge).ok_or_else(|| {
            Error::ConfigurationError(format!("no connection information for {}", edge))
        })?;

        self.runner
            .issue(&edge.follower, &Command::SetUpstream(conninfo))
            .await?;

        let addressing = self.settings.addressing();
        self.runner
            .wait_for(&edge.follower, &format!("stream from {}", edge.upstream), |observed| {
                observed.is_receiving()
                    && classify_sender(&observed.sender_host, topology, addressing) == edge.upstream
            })
            .await?;
        Ok(())
    }
}
