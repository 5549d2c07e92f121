// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for the switchover controller
//!
//! These tests use proptest to generate random topologies and event sequences
//! and verify that:
//! 1. The state machine never panics and never leaves the phase set
//! 2. Primary selection keeps a healthy primary and never picks an unhealthy one
//! 3. Applying an enforcement plan leaves no missing edges behind
//! 4. Validation is deterministic

use std::collections::BTreeMap;

use proptest::prelude::*;

#[path = "../common/mod.rs"]
mod common;

use common::*;
use replica_switch_operator::controller::enforcer::EnforcementPlan;
use replica_switch_operator::controller::state_machine::{
    SwitchEvent, SwitchStateMachine, TransitionContext, TransitionResult, determine_event,
};
use replica_switch_operator::controller::validation::validate_spec;
use replica_switch_operator::crd::SwitchPhase;
use replica_switch_operator::topology::{
    ClusterTopology, InstanceAddressing, InstanceId, ObservedHealth, ObservedReplication,
    RoleIntent, Upstream, desired_edges, select_primary,
};

const SOURCE_HOST: &str = "src-rw.prod.svc";

// =============================================================================
// Strategy generators
// =============================================================================

fn switch_phase() -> impl Strategy<Value = SwitchPhase> {
    prop_oneof![
        Just(SwitchPhase::SteadyReplica),
        Just(SwitchPhase::SteadyPrimary),
        Just(SwitchPhase::PromotingToPrimary),
        Just(SwitchPhase::DemotingToReplica),
        Just(SwitchPhase::Failed),
    ]
}

fn switch_event() -> impl Strategy<Value = SwitchEvent> {
    prop_oneof![
        Just(SwitchEvent::PromotionRequested),
        Just(SwitchEvent::PromotionCompleted),
        Just(SwitchEvent::DemotionRequested),
        Just(SwitchEvent::DemotionCompleted),
        Just(SwitchEvent::RetryBudgetExhausted),
        Just(SwitchEvent::NoEligiblePrimary),
        Just(SwitchEvent::PromotionResumed),
        Just(SwitchEvent::DemotionResumed),
        Just(SwitchEvent::ReplicaRestored),
        Just(SwitchEvent::PrimaryRestored),
    ]
}

fn role_intent() -> impl Strategy<Value = RoleIntent> {
    prop_oneof![Just(RoleIntent::Primary), Just(RoleIntent::Replica)]
}

fn transition_context() -> impl Strategy<Value = TransitionContext> {
    (
        role_intent(),
        proptest::option::of(switch_phase()),
        0..8u32,
        0..5u32,
        any::<bool>(),
    )
        .prop_map(|(intent, failed_during, attempts, drift_passes, primary_eligible)| {
            TransitionContext {
                intent,
                failed_during,
                attempts,
                max_attempts: 5,
                drift_passes,
                drift_budget: 3,
                primary_eligible,
            }
        })
}

/// What an instance streams from, by index into the generated wiring
#[derive(Debug, Clone)]
enum Wiring {
    /// Out of recovery
    Writable,
    /// Receiving from the external source
    Source,
    /// Receiving from the member with this index
    Member(usize),
    /// Receiving from a host that is neither
    Stray,
    /// Not observed on this pass
    Unobserved,
}

fn wiring(members: usize) -> impl Strategy<Value = Wiring> {
    prop_oneof![
        Just(Wiring::Writable),
        Just(Wiring::Source),
        (0..members).prop_map(Wiring::Member),
        Just(Wiring::Stray),
        Just(Wiring::Unobserved),
    ]
}

/// Instance count, designated primary index, intent and live wiring
fn cluster_wiring() -> impl Strategy<Value = (usize, RoleIntent, Vec<Wiring>)> {
    (1..7usize)
        .prop_flat_map(|n| {
            (
                0..n,
                role_intent(),
                proptest::collection::vec(wiring(n), n),
            )
        })
}

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("db-{}", i)).collect()
}

fn topology_for(n: usize, primary: usize, intent: RoleIntent) -> ClusterTopology {
    let names = names(n);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    match intent {
        RoleIntent::Replica => replica_topology(&refs, Some(&names[primary]), "src", SOURCE_HOST),
        RoleIntent::Primary => primary_topology(&refs, Some(&names[primary])),
    }
}

fn observations_for(
    wiring: &[Wiring],
    addressing: &InstanceAddressing,
) -> BTreeMap<InstanceId, ObservedReplication> {
    let names = names(wiring.len());
    wiring
        .iter()
        .enumerate()
        .filter_map(|(i, w)| {
            let sender_host = match w {
                Wiring::Unobserved => return None,
                Wiring::Writable => String::new(),
                Wiring::Source => SOURCE_HOST.to_string(),
                Wiring::Member(m) => addressing.host_for(&InstanceId::from(names[*m].as_str())),
                Wiring::Stray => "decommissioned.example".to_string(),
            };
            Some((
                InstanceId::from(names[i].as_str()),
                ObservedReplication {
                    in_recovery: !matches!(w, Wiring::Writable),
                    sender_host,
                    followers: vec![],
                },
            ))
        })
        .collect()
}

// =============================================================================
// Property-based tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: State machine never panics on any phase/event combination
    #[test]
    fn prop_state_machine_no_panic(
        phase in switch_phase(),
        event in switch_event(),
        ctx in transition_context()
    ) {
        let sm = SwitchStateMachine::new();
        let result = sm.transition(&phase, event, &ctx);
        if let TransitionResult::Success { from, .. } = &result {
            prop_assert_eq!(*from, phase);
        }
    }

    /// Property: Failed is only entered through the two failure events
    #[test]
    fn prop_failed_only_via_failure_events(
        phase in switch_phase(),
        event in switch_event(),
        ctx in transition_context()
    ) {
        let sm = SwitchStateMachine::new();
        if sm.transition(&phase, event, &ctx).target() == Some(SwitchPhase::Failed) {
            prop_assert!(matches!(
                event,
                SwitchEvent::RetryBudgetExhausted | SwitchEvent::NoEligiblePrimary
            ));
        }
    }

    /// Property: Every event raised from observed context is accepted by the table
    #[test]
    fn prop_determined_events_are_valid(
        phase in switch_phase(),
        ctx in transition_context()
    ) {
        let sm = SwitchStateMachine::new();
        if let Some(event) = determine_event(&phase, &ctx) {
            prop_assert!(
                sm.can_transition(&phase, &event),
                "{} raised {} with no table entry",
                phase,
                event
            );
        }
    }

    /// Property: In-flight transitions only react to a missing primary
    #[test]
    fn prop_in_flight_phases_ignore_intent(ctx in transition_context()) {
        for phase in [SwitchPhase::PromotingToPrimary, SwitchPhase::DemotingToReplica] {
            let event = determine_event(&phase, &ctx);
            prop_assert!(event.is_none() || event == Some(SwitchEvent::NoEligiblePrimary));
        }
    }

    /// Property: Random event sequences stay within the phase set and never panic
    #[test]
    fn prop_event_sequences_never_panic(
        events in proptest::collection::vec((switch_event(), transition_context()), 0..40)
    ) {
        let sm = SwitchStateMachine::new();
        let mut phase = SwitchPhase::SteadyReplica;
        for (event, ctx) in events {
            if let Some(next) = sm.transition(&phase, event, &ctx).target() {
                phase = next;
            }
        }
        prop_assert!(!sm.valid_events(&phase).is_empty());
    }

    /// Property: A healthy current primary is always kept
    #[test]
    fn prop_selection_keeps_healthy_primary(
        (n, primary, intent, healthy) in (1..7usize).prop_flat_map(|n| {
            (Just(n), 0..n, role_intent(), proptest::collection::vec(any::<bool>(), n))
        })
    ) {
        let topology = topology_for(n, primary, intent);
        let health: ObservedHealth = topology
            .instances()
            .iter()
            .zip(&healthy)
            .filter(|(_, h)| **h)
            .map(|(id, _)| id.clone())
            .collect();

        match select_primary(&topology, &health) {
            Ok(selected) => {
                prop_assert!(health.is_healthy(&selected));
                if health.is_healthy(topology.current_primary().unwrap()) {
                    prop_assert_eq!(Some(&selected), topology.current_primary());
                } else {
                    let first = topology.instances().iter().find(|id| health.is_healthy(id));
                    prop_assert_eq!(Some(&selected), first);
                }
            }
            Err(_) => prop_assert_eq!(health.healthy_count(), 0),
        }
    }

    /// Property: Desired wiring is a tree rooted at the designated primary
    #[test]
    fn prop_desired_edges_follow_primary(
        (n, primary, intent) in (1..7usize).prop_flat_map(|n| (Just(n), 0..n, role_intent()))
    ) {
        let topology = topology_for(n, primary, intent);
        let edges = desired_edges(&topology);
        let primary_id = topology.current_primary().unwrap();

        let expected = match intent {
            RoleIntent::Replica => n,
            RoleIntent::Primary => n - 1,
        };
        prop_assert_eq!(edges.len(), expected);
        for edge in &edges {
            if &edge.follower == primary_id {
                prop_assert_eq!(&edge.upstream, &Upstream::External);
            } else {
                prop_assert_eq!(&edge.upstream, &Upstream::Instance(primary_id.clone()));
            }
        }
    }

    /// Property: Applying every planned reconfiguration leaves only deferred edges missing
    #[test]
    fn prop_enforcement_converges((primary, intent, wiring) in cluster_wiring()) {
        let n = wiring.len();
        let topology = topology_for(n, primary, intent);
        let addressing = settings().addressing().clone();
        let mut observations = observations_for(&wiring, &addressing);

        let plan = EnforcementPlan::compute(&topology, &observations, &addressing);
        for edge in &plan.reconfigurations {
            prop_assert!(plan.desired.contains(edge));
            prop_assert!(!plan.observed.contains(edge));
            prop_assert!(observations.contains_key(&edge.follower));
        }
        for edge in &plan.blocked {
            prop_assert!(!plan.desired.iter().any(|d| d.follower == edge.follower));
        }

        for edge in &plan.reconfigurations {
            let host = match &edge.upstream {
                Upstream::External => SOURCE_HOST.to_string(),
                Upstream::Instance(id) => addressing.host_for(id),
                Upstream::Unresolved(host) => host.clone(),
            };
            let observed = observations.get_mut(&edge.follower).unwrap();
            observed.in_recovery = true;
            observed.sender_host = host;
        }

        let second = EnforcementPlan::compute(&topology, &observations, &addressing);
        prop_assert!(second.reconfigurations.is_empty(), "{:?}", second.reconfigurations);
        prop_assert_eq!(second.deferred, plan.deferred);
        prop_assert_eq!(second.blocked, plan.blocked);
    }

    /// Property: Validation is deterministic
    #[test]
    fn prop_validation_deterministic(instances in -5..120i32, replica in any::<bool>()) {
        let mut builder = PostgresClusterBuilder::new("db", "default").with_instances(instances);
        if replica {
            builder = builder.with_external_cluster("src", SOURCE_HOST).with_replica("src", true);
        }
        let cluster = builder.build();

        let first = validate_spec(&cluster);
        let second = validate_spec(&cluster);
        prop_assert_eq!(first.is_ok(), second.is_ok());
        prop_assert_eq!(first.is_ok(), (1..=100).contains(&instances));
    }
}
