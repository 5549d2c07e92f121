//! The `ReplicaClusterSwitch` status condition
//!
//! `ConditionReporter::set_condition` is the only code path that mutates the
//! condition. It never moves `lastTransitionTime` backwards and leaves the
//! condition untouched when the outcome is identical, so watchers see no churn
//! from steady-state passes.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::controller::error::Error;
use crate::crd::{Condition, PostgresCluster, SwitchPhase};

/// Condition type recording the last switch outcome
pub const REPLICA_CLUSTER_SWITCH: &str = "ReplicaClusterSwitch";

/// Reasons published on the switch condition for non-error outcomes
pub mod reasons {
    pub const CLUSTER_IS_PRIMARY: &str = "ClusterIsPrimary";
    pub const CLUSTER_IS_REPLICA: &str = "ClusterIsReplica";
    pub const PROMOTION_IN_PROGRESS: &str = "PromotionInProgress";
    pub const DEMOTION_IN_PROGRESS: &str = "DemotionInProgress";
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a switchover pass as published on the condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl SwitchOutcome {
    pub fn new(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// The cluster settled in a steady phase
    pub fn steady(phase: SwitchPhase, primary: Option<&str>) -> Self {
        let primary = primary.unwrap_or("<none>");
        match phase {
            SwitchPhase::SteadyPrimary => Self::new(
                ConditionStatus::True,
                reasons::CLUSTER_IS_PRIMARY,
                format!("Cluster is acting as primary, write leader {}", primary),
            ),
            _ => Self::new(
                ConditionStatus::True,
                reasons::CLUSTER_IS_REPLICA,
                format!(
                    "Cluster is acting as replica, designated primary {}",
                    primary
                ),
            ),
        }
    }

    /// A promotion or demotion is in flight
    pub fn in_progress(phase: SwitchPhase, message: impl Into<String>) -> Self {
        let reason = match phase {
            SwitchPhase::PromotingToPrimary => reasons::PROMOTION_IN_PROGRESS,
            _ => reasons::DEMOTION_IN_PROGRESS,
        };
        Self::new(ConditionStatus::False, reason, message)
    }

    /// A surfaced failure
    ///
    /// A missing primary leaves the outcome undetermined; everything else is
    /// a definite failure.
    pub fn failed(error: &Error) -> Self {
        let status = match error {
            Error::NoEligiblePrimary(_) => ConditionStatus::Unknown,
            _ => ConditionStatus::False,
        };
        Self::new(status, error.reason(), error.to_string())
    }
}

/// Maintains the switch condition inside a cluster's condition list
pub struct ConditionReporter {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionReporter {
    /// Start from the conditions currently stored on the resource
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Current switch condition, if one was ever published
    pub fn current(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.type_ == REPLICA_CLUSTER_SWITCH)
    }

    /// Record an outcome; returns whether the condition changed
    ///
    /// Status or reason changes move `lastTransitionTime` to `now`, or keep
    /// the stored time if it is later. Message-only changes keep the time.
    pub fn set_condition(&mut self, outcome: &SwitchOutcome, now: DateTime<Utc>) -> bool {
        let generation = self.generation;
        let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == REPLICA_CLUSTER_SWITCH)
        else {
            self.conditions.push(Condition {
                type_: REPLICA_CLUSTER_SWITCH.to_string(),
                status: outcome.status.as_str().to_string(),
                reason: outcome.reason.clone(),
                message: outcome.message.clone(),
                last_transition_time: timestamp(now),
                observed_generation: generation,
            });
            return true;
        };

        let same_status = existing.status == outcome.status.as_str();
        let same_reason = existing.reason == outcome.reason;
        if same_status && same_reason && existing.message == outcome.message {
            return false;
        }

        if !(same_status && same_reason) {
            existing.last_transition_time = monotonic_time(&existing.last_transition_time, now);
        }
        existing.status = outcome.status.as_str().to_string();
        existing.reason = outcome.reason.clone();
        existing.message = outcome.message.clone();
        existing.observed_generation = generation;
        true
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Whether the switch condition is published for this cluster
///
/// It is created once a cluster declares a replica block and, once created,
/// kept for the lifetime of the cluster.
pub fn condition_applies(cluster: &PostgresCluster) -> bool {
    cluster.spec.replica.is_some()
        || cluster
            .status
            .as_ref()
            .is_some_and(|s| s.conditions.iter().any(|c| c.type_ == REPLICA_CLUSTER_SWITCH))
}

/// RFC 3339 in UTC with second precision, as Kubernetes writes `metav1.Time`
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn monotonic_time(previous: &str, now: DateTime<Utc>) -> String {
    match DateTime::parse_from_rfc3339(previous) {
        Ok(prev) if prev.with_timezone(&Utc) > now => previous.to_string(),
        _ => timestamp(now),
    }
}
