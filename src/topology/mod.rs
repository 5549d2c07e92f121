//! Pure replication topology model for replica clusters
//!
//! Nothing in this module talks to Kubernetes or PostgreSQL. It describes
//! who should stream from whom, compares that against what was observed and
//! chooses the designated primary. The controller layer feeds it observed
//! state and turns its answers into commands.

pub mod edges;
pub mod model;
pub mod selector;

pub use edges::{
    Drift, ObservedReplication, StreamingEdge, Upstream, classify_sender, desired_edges,
    observed_edges,
};
pub use model::{
    ClusterTopology, ExternalSource, InstanceAddressing, InstanceId, RoleIntent, SourceCredentials,
    render_conninfo,
};
pub use selector::{ObservedHealth, elect_primary, select_primary};

use thiserror::Error;

/// Errors produced by the topology model and the primary selector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Malformed topology, requires corrected intent
    #[error("Invalid topology: {0}")]
    Configuration(String),

    /// No healthy instance can act as designated primary (transient)
    #[error("No eligible primary: none of the {candidates} instances is healthy")]
    NoEligiblePrimary { candidates: usize },
}

pub type TopologyResult<T> = std::result::Result<T, TopologyError>;
