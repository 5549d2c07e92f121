//! Streaming edges: desired wiring, observed wiring and the drift between them

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::model::{ClusterTopology, InstanceAddressing, InstanceId, RoleIntent};

/// Where a follower receives WAL from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Upstream {
    /// The declared external source cluster
    External,
    /// Another member of the same cluster
    Instance(InstanceId),
    /// A sender host that matches neither the source nor any member
    Unresolved(String),
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Upstream::External => write!(f, "external"),
            Upstream::Instance(id) => write!(f, "{}", id),
            Upstream::Unresolved(host) => write!(f, "host:{}", host),
        }
    }
}

/// A directed follower-to-upstream replication relationship
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamingEdge {
    pub follower: InstanceId,
    pub upstream: Upstream,
}

impl StreamingEdge {
    pub fn new(follower: InstanceId, upstream: Upstream) -> Self {
        Self { follower, upstream }
    }

    pub fn external(follower: impl Into<InstanceId>) -> Self {
        Self::new(follower.into(), Upstream::External)
    }

    pub fn to_instance(follower: impl Into<InstanceId>, upstream: impl Into<InstanceId>) -> Self {
        Self::new(follower.into(), Upstream::Instance(upstream.into()))
    }
}

impl fmt::Display for StreamingEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.follower, self.upstream)
    }
}

/// Replication state reported by a single instance
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedReplication {
    /// `pg_is_in_recovery()`
    pub in_recovery: bool,
    /// `pg_stat_wal_receiver.sender_host`, empty when not receiving
    pub sender_host: String,
    /// `pg_stat_replication.application_name` of every connected standby
    pub followers: Vec<String>,
}

impl ObservedReplication {
    /// Whether the instance currently receives WAL from anywhere
    pub fn is_receiving(&self) -> bool {
        !self.sender_host.is_empty()
    }
}

/// Compute the required wiring from the topology alone
///
/// Replica intent: the designated primary streams from the external source
/// and every other member streams from the designated primary. Primary
/// intent: nothing streams externally and every other member streams from the
/// write leader. Without an elected primary nothing is required yet.
pub fn desired_edges(topology: &ClusterTopology) -> BTreeSet<StreamingEdge> {
    let mut edges = BTreeSet::new();
    let Some(primary) = topology.current_primary() else {
        return edges;
    };

    if topology.intent() == RoleIntent::Replica {
        edges.insert(StreamingEdge::new(primary.clone(), Upstream::External));
    }

    for standby in topology.standbys() {
        edges.insert(StreamingEdge::new(
            standby.clone(),
            Upstream::Instance(primary.clone()),
        ));
    }

    edges
}

/// Map an observed `sender_host` to the upstream it designates
pub fn classify_sender(
    sender_host: &str,
    topology: &ClusterTopology,
    addressing: &InstanceAddressing,
) -> Upstream {
    if topology.external_source().map(|s| s.host()) == Some(sender_host) {
        Upstream::External
    } else if let Some(member) = addressing.resolve(sender_host, topology.instances()) {
        Upstream::Instance(member.clone())
    } else {
        Upstream::Unresolved(sender_host.to_string())
    }
}

/// Reconstruct the live wiring from per-instance observations
///
/// The wal receiver view of an instance is authoritative for that instance.
/// Follower lists only contribute edges for members that could not be
/// observed directly.
pub fn observed_edges(
    observations: &BTreeMap<InstanceId, ObservedReplication>,
    topology: &ClusterTopology,
    addressing: &InstanceAddressing,
) -> BTreeSet<StreamingEdge> {
    let mut edges = BTreeSet::new();

    for (id, observed) in observations {
        if observed.is_receiving() {
            let upstream = classify_sender(&observed.sender_host, topology, addressing);
            edges.insert(StreamingEdge::new(id.clone(), upstream));
        }

        for name in &observed.followers {
            let Some(follower) = addressing.resolve(name, topology.instances()) else {
                continue;
            };
            if follower != id && !observations.contains_key(follower) {
                edges.insert(StreamingEdge::new(
                    follower.clone(),
                    Upstream::Instance(id.clone()),
                ));
            }
        }
    }

    edges
}

/// Divergence between desired and observed streaming topology
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Drift {
    /// Desired edges that are not live
    pub add: BTreeSet<StreamingEdge>,
    /// Live edges that are not desired
    pub remove: BTreeSet<StreamingEdge>,
}

impl Drift {
    /// Symmetric difference between desired and observed edges
    pub fn between(desired: &BTreeSet<StreamingEdge>, observed: &BTreeSet<StreamingEdge>) -> Self {
        Self {
            add: desired.difference(observed).cloned().collect(),
            remove: observed.difference(desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.remove.len()
    }
}
