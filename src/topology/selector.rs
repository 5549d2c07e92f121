//! Designated primary selection
//!
//! Stability wins over optimality: a healthy current primary is always kept,
//! even when another instance would qualify, so the streaming topology does
//! not churn between passes.

use std::collections::BTreeSet;

use tracing::info;

use super::model::{ClusterTopology, InstanceId};
use super::{TopologyError, TopologyResult};

/// Instances that passed health checks on the current pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedHealth {
    healthy: BTreeSet<InstanceId>,
}

impl ObservedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_healthy(&mut self, id: InstanceId) {
        self.healthy.insert(id);
    }

    pub fn is_healthy(&self, id: &InstanceId) -> bool {
        self.healthy.contains(id)
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.len()
    }
}

impl FromIterator<InstanceId> for ObservedHealth {
    fn from_iter<T: IntoIterator<Item = InstanceId>>(iter: T) -> Self {
        Self {
            healthy: iter.into_iter().collect(),
        }
    }
}

/// Choose the designated primary
///
/// Keeps the current primary when it is a healthy member, otherwise picks the
/// lowest-ordinal healthy instance.
pub fn select_primary(
    topology: &ClusterTopology,
    health: &ObservedHealth,
) -> TopologyResult<InstanceId> {
    if let Some(current) = topology.current_primary()
        && health.is_healthy(current)
    {
        return Ok(current.clone());
    }

    // instances() is sorted by ordinal
    topology
        .instances()
        .iter()
        .find(|id| health.is_healthy(id))
        .cloned()
        .ok_or(TopologyError::NoEligiblePrimary {
            candidates: topology.instances().len(),
        })
}

/// Run selection and record the result in the topology
///
/// Returns true when the designated primary changed.
pub fn elect_primary(
    topology: &mut ClusterTopology,
    health: &ObservedHealth,
) -> TopologyResult<bool> {
    let selected = select_primary(topology, health)?;
    if topology.current_primary() == Some(&selected) {
        return Ok(false);
    }

    info!(
        cluster = %topology.name(),
        previous = ?topology.current_primary().map(InstanceId::as_str),
        elected = %selected,
        "Electing designated primary"
    );
    topology.set_current_primary(selected)?;
    Ok(true)
}
