//! Transition notifications
//!
//! Completed promotions and demotions are published as Kubernetes Events on
//! the PostgresCluster. The credential rotation tooling watches for
//! `ReplicaClusterPromoted` to publish application secrets for the new
//! primary.

use std::future::Future;

use chrono::{DateTime, Utc};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::{debug, warn};

use crate::crd::PostgresCluster;

/// Kind of completed role transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Promoted,
    Demoted,
}

impl TransitionKind {
    /// Event reason published for this transition
    pub fn reason(&self) -> &'static str {
        match self {
            TransitionKind::Promoted => "ReplicaClusterPromoted",
            TransitionKind::Demoted => "ReplicaClusterDemoted",
        }
    }

    /// Label used by the switchover metrics
    pub fn direction(&self) -> &'static str {
        match self {
            TransitionKind::Promoted => "promote",
            TransitionKind::Demoted => "demote",
        }
    }
}

/// A completed transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub kind: TransitionKind,
    pub cluster: String,
    /// Instance that became write leader or designated primary
    pub instance: String,
    pub at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn note(&self) -> String {
        match self.kind {
            TransitionKind::Promoted => format!(
                "Cluster {} promoted: {} is the write leader",
                self.cluster, self.instance
            ),
            TransitionKind::Demoted => format!(
                "Cluster {} demoted: {} follows the external source",
                self.cluster, self.instance
            ),
        }
    }
}

/// Receiver of transition events
pub trait TransitionNotifier: Send + Sync {
    /// Deliver an event; delivery failures are logged, never propagated
    fn notify(
        &self,
        cluster: &PostgresCluster,
        event: &TransitionEvent,
    ) -> impl Future<Output = ()> + Send;
}

/// Publishes transition events through the Kubernetes Events API
pub struct KubeEventNotifier {
    recorder: Recorder,
}

impl KubeEventNotifier {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: "replica-switch-operator".to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl TransitionNotifier for KubeEventNotifier {
    async fn notify(&self, cluster: &PostgresCluster, event: &TransitionEvent) {
        let reference = cluster.object_ref(&());
        let published = self
            .recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: event.kind.reason().to_string(),
                    note: Some(event.note()),
                    action: "Switchover".to_string(),
                    secondary: None,
                },
                &reference,
            )
            .await;

        match published {
            Ok(()) => debug!(cluster = %event.cluster, reason = event.kind.reason(), "Published transition event"),
            Err(e) => warn!(cluster = %event.cluster, error = %e, "Failed to publish transition event"),
        }
    }
}
