//! Switchover passes against simulated instances

use std::time::Duration;

use replica_switch_operator::controller::condition::{ConditionStatus, reasons};
use replica_switch_operator::controller::error::Error;
use replica_switch_operator::controller::events::{TransitionKind, TransitionNotifier};
use replica_switch_operator::crd::{SwitchPhase, SwitchStatus};
use replica_switch_operator::topology::{InstanceId, RoleIntent};

use crate::common::*;

const NAMES: [&str; 3] = ["db-1", "db-2", "db-3"];
const SOURCE_HOST: &str = "src-rw.prod.svc";

fn replica_record() -> SwitchStatus {
    SwitchStatus {
        phase: SwitchPhase::SteadyReplica,
        source: Some("src".to_string()),
        ..Default::default()
    }
}

mod steady_state {
    use super::*;

    #[tokio::test]
    async fn test_first_pass_adopts_streaming_primary() {
        let sim = SimulatedCluster::replica(&NAMES, "db-2", SOURCE_HOST);
        let topology = replica_topology(&NAMES, None, "src", SOURCE_HOST);

        let outcome = run_pass(&sim, topology, None, &fast_config()).await;

        assert_eq!(outcome.record.phase, SwitchPhase::SteadyReplica);
        assert_eq!(outcome.record.source.as_deref(), Some("src"));
        assert_eq!(
            outcome.topology.current_primary().map(InstanceId::as_str),
            Some("db-2")
        );
        assert_eq!(outcome.drift, 0);
        assert_eq!(outcome.commands_issued, 0);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.outcome.status, ConditionStatus::True);
        assert_eq!(outcome.outcome.reason, reasons::CLUSTER_IS_REPLICA);
    }

    #[tokio::test]
    async fn test_converged_pass_is_idempotent() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        let config = fast_config();

        let first = run_pass(
            &sim,
            replica_topology(&NAMES, Some("db-1"), "src", SOURCE_HOST),
            Some(replica_record()),
            &config,
        )
        .await;
        let second = run_pass(
            &sim,
            first.topology.clone(),
            Some(first.record.clone()),
            &config,
        )
        .await;

        assert_eq!(first.record, second.record);
        assert_eq!(first.outcome, second.outcome);
        assert_eq!(second.commands_issued, 0);
        assert_eq!(second.requeue_after, config.steady_requeue);
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_only_misdirected_follower_is_reconfigured() {
        // a streams from the source, b wrongly streams from the source too,
        // c already follows a
        let sim = SimulatedCluster::new();
        sim.set("a", SimInstance::standby_of("S"));
        sim.set("b", SimInstance::standby_of("S"));
        sim.set("c", SimInstance::standby_of(&sim.host("a")));
        let topology = replica_topology(&["a", "b", "c"], Some("a"), "src", "S");

        let outcome = run_pass(&sim, topology, Some(replica_record()), &fast_config()).await;

        assert_eq!(outcome.drift, 2);
        assert!(outcome.error.is_none());
        assert_eq!(
            sim.commands(),
            vec![format!("set_upstream b {}", sim.host("a"))]
        );
        assert_eq!(sim.state("b").upstream, Some(sim.host("a")));
        assert_eq!(sim.state("a").upstream.as_deref(), Some("S"));
        assert_eq!(sim.state("c").upstream, Some(sim.host("a")));
    }

    #[tokio::test]
    async fn test_unhealthy_primary_is_replaced_and_rewired() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        sim.update("db-1", |s| s.reachable = false);
        let topology = replica_topology(&NAMES, Some("db-1"), "src", SOURCE_HOST);

        let outcome = run_pass(&sim, topology, Some(replica_record()), &fast_config()).await;

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(
            outcome.topology.current_primary().map(InstanceId::as_str),
            Some("db-2")
        );
        assert_eq!(sim.state("db-2").upstream.as_deref(), Some(SOURCE_HOST));
        assert_eq!(sim.state("db-3").upstream, Some(sim.host("db-2")));
        assert_eq!(outcome.record.phase, SwitchPhase::SteadyReplica);
    }
}

mod transitions {
    use super::*;

    #[tokio::test]
    async fn test_promotion_to_primary() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        let config = fast_config();
        let first = run_pass(
            &sim,
            replica_topology(&NAMES, None, "src", SOURCE_HOST),
            None,
            &config,
        )
        .await;
        sim.clear_commands();

        let promoted = run_pass(
            &sim,
            flip_intent(&first.topology, RoleIntent::Primary, None),
            Some(first.record.clone()),
            &config,
        )
        .await;

        assert_eq!(promoted.record.phase, SwitchPhase::SteadyPrimary);
        assert_eq!(promoted.record.source, None);
        assert!(promoted.record.transition_started_at.is_none());
        assert_eq!(
            sim.commands(),
            vec!["clear_upstream db-1".to_string(), "promote db-1".to_string()]
        );
        assert!(!sim.state("db-1").in_recovery);

        assert_eq!(promoted.events.len(), 1);
        assert_eq!(promoted.events[0].kind, TransitionKind::Promoted);
        assert_eq!(promoted.events[0].instance, "db-1");
        assert_eq!(promoted.outcome.reason, reasons::CLUSTER_IS_PRIMARY);
        assert_eq!(promoted.requeue_after, config.transition_requeue);

        // Standbys already follow db-1, so the next pass is quiet
        sim.clear_commands();
        let settled = run_pass(
            &sim,
            promoted.topology.clone(),
            Some(promoted.record.clone()),
            &config,
        )
        .await;
        assert_eq!(settled.drift, 0);
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_demotion_to_replica() {
        let sim = SimulatedCluster::primary(&NAMES, "db-1");
        let config = fast_config();
        let first = run_pass(&sim, primary_topology(&NAMES, None), None, &config).await;
        assert_eq!(first.record.phase, SwitchPhase::SteadyPrimary);
        assert_eq!(
            first.topology.current_primary().map(InstanceId::as_str),
            Some("db-1")
        );

        let demoted = run_pass(
            &sim,
            flip_intent(
                &first.topology,
                RoleIntent::Replica,
                Some(source("src", SOURCE_HOST)),
            ),
            Some(first.record.clone()),
            &config,
        )
        .await;

        assert_eq!(demoted.record.phase, SwitchPhase::SteadyReplica);
        assert_eq!(demoted.record.source.as_deref(), Some("src"));
        assert_eq!(sim.commands(), vec![format!("demote db-1 {}", SOURCE_HOST)]);
        let db1 = sim.state("db-1");
        assert!(db1.in_recovery);
        assert_eq!(db1.upstream.as_deref(), Some(SOURCE_HOST));

        assert_eq!(demoted.events.len(), 1);
        assert_eq!(demoted.events[0].kind, TransitionKind::Demoted);
        assert_eq!(demoted.outcome.reason, reasons::CLUSTER_IS_REPLICA);
    }

    #[tokio::test]
    async fn test_in_flight_promotion_completes_before_flip_back() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        let config = fast_config();
        let in_flight = SwitchStatus {
            phase: SwitchPhase::PromotingToPrimary,
            source: Some("src".to_string()),
            transition_started_at: Some("2026-01-01T00:00:00+00:00".to_string()),
            ..Default::default()
        };
        // Intent already flipped back to replica while promoting
        let topology = replica_topology(&NAMES, Some("db-1"), "src", SOURCE_HOST);

        let promoted = run_pass(&sim, topology, Some(in_flight), &config).await;
        assert_eq!(promoted.record.phase, SwitchPhase::SteadyPrimary);
        assert_eq!(promoted.events[0].kind, TransitionKind::Promoted);

        let demoted = run_pass(
            &sim,
            promoted.topology.clone(),
            Some(promoted.record.clone()),
            &config,
        )
        .await;
        assert_eq!(demoted.record.phase, SwitchPhase::SteadyReplica);
        assert_eq!(demoted.events[0].kind, TransitionKind::Demoted);
        assert!(sim.state("db-1").in_recovery);
    }

    #[tokio::test]
    async fn test_transition_events_reach_notifier() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        let cluster = PostgresClusterBuilder::replica("db", "default", "src", SOURCE_HOST)
            .with_instances(3)
            .build();
        let notifier = RecordingNotifier::default();

        let outcome = run_pass(
            &sim,
            primary_topology(&NAMES, Some("db-1")),
            Some(replica_record()),
            &fast_config(),
        )
        .await;
        for event in &outcome.events {
            notifier.notify(&cluster, event).await;
        }

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind.reason(), "ReplicaClusterPromoted");
        assert_eq!(events[0].cluster, "db");
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_no_eligible_primary_then_recovery() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        for name in NAMES {
            sim.update(name, |s| s.reachable = false);
        }
        let config = fast_config();

        let failed = run_pass(
            &sim,
            replica_topology(&NAMES, Some("db-1"), "src", SOURCE_HOST),
            Some(replica_record()),
            &config,
        )
        .await;
        assert_eq!(failed.record.phase, SwitchPhase::Failed);
        assert_eq!(failed.record.failed_during, Some(SwitchPhase::SteadyReplica));
        assert!(matches!(failed.error, Some(Error::NoEligiblePrimary(_))));
        assert_eq!(failed.outcome.status, ConditionStatus::Unknown);
        assert_eq!(failed.commands_issued, 0);

        for name in NAMES {
            sim.update(name, |s| s.reachable = true);
        }
        let restored = run_pass(
            &sim,
            failed.topology.clone(),
            Some(failed.record.clone()),
            &config,
        )
        .await;
        assert_eq!(restored.record.phase, SwitchPhase::SteadyReplica);
        assert_eq!(restored.record.failed_during, None);
        assert_eq!(restored.record.attempts, 0);
        assert_eq!(restored.outcome.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_rejected_promotion_exhausts_budget_then_resumes() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        sim.update("db-1", |s| s.rejects_promotion = true);
        let config = fast_config();

        let outcomes = run_until(
            &sim,
            primary_topology(&NAMES, Some("db-1")),
            Some(replica_record()),
            &config,
            config.switchover.max_attempts as usize,
            |o| o.record.phase == SwitchPhase::Failed,
        )
        .await;

        let in_progress = &outcomes[0];
        assert_eq!(in_progress.record.phase, SwitchPhase::PromotingToPrimary);
        assert_eq!(in_progress.record.attempts, 1);
        assert_eq!(in_progress.outcome.reason, reasons::PROMOTION_IN_PROGRESS);
        assert_eq!(in_progress.outcome.status, ConditionStatus::False);

        let failed = outcomes.last().unwrap();
        assert_eq!(failed.record.phase, SwitchPhase::Failed);
        assert_eq!(
            failed.record.failed_during,
            Some(SwitchPhase::PromotingToPrimary)
        );
        assert_eq!(failed.outcome.reason, "InstanceCommandFailed");
        assert!(failed.events.is_empty());

        sim.update("db-1", |s| s.rejects_promotion = false);
        let resumed = run_pass(
            &sim,
            failed.topology.clone(),
            Some(failed.record.clone()),
            &config,
        )
        .await;
        assert_eq!(resumed.record.phase, SwitchPhase::SteadyPrimary);
        assert_eq!(resumed.events.len(), 1);
        assert!(!sim.state("db-1").in_recovery);
    }

    #[tokio::test]
    async fn test_unconfirmed_reconfiguration_counts_attempts() {
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        sim.set(
            "db-3",
            SimInstance {
                ignores_upstream: true,
                ..SimInstance::standby_of(SOURCE_HOST)
            },
        );
        let config = fast_config();

        let outcomes = run_until(
            &sim,
            replica_topology(&NAMES, Some("db-1"), "src", SOURCE_HOST),
            Some(replica_record()),
            &config,
            config.switchover.max_attempts as usize,
            |o| o.record.phase == SwitchPhase::Failed,
        )
        .await;

        assert_eq!(outcomes.len(), config.switchover.max_attempts as usize);
        assert!(matches!(
            outcomes[0].error,
            Some(Error::ReconfigurationTimeout { .. })
        ));
        assert_eq!(outcomes[0].record.phase, SwitchPhase::SteadyReplica);
        assert!(outcomes[0].requeue_after < config.error_backoff.max_delay);

        let failed = outcomes.last().unwrap();
        assert_eq!(failed.record.phase, SwitchPhase::Failed);
        assert_eq!(failed.outcome.reason, "ReconfigurationTimeout");
    }

    #[tokio::test]
    async fn test_blocked_drift_counts_drift_passes() {
        // A write leader still receiving from a host nothing knows about
        let sim = SimulatedCluster::new();
        sim.set("db-1", SimInstance::standby_of("decommissioned.example"));
        let config = fast_config();

        let outcomes = run_until(
            &sim,
            primary_topology(&["db-1"], Some("db-1")),
            Some(SwitchStatus {
                phase: SwitchPhase::SteadyPrimary,
                ..Default::default()
            }),
            &config,
            config.switchover.drift_budget as usize,
            |o| o.record.phase == SwitchPhase::Failed,
        )
        .await;

        assert!(matches!(
            outcomes[0].error,
            Some(Error::DriftPersistence { passes: 1, drift: 1 })
        ));
        let failed = outcomes.last().unwrap();
        assert_eq!(failed.record.phase, SwitchPhase::Failed);
        assert_eq!(failed.outcome.reason, "DriftPersistence");
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_source_change_mid_demotion_is_rejected() {
        let sim = SimulatedCluster::primary(&NAMES, "db-1");
        let demoting = SwitchStatus {
            phase: SwitchPhase::DemotingToReplica,
            source: Some("old".to_string()),
            ..Default::default()
        };

        let outcome = run_pass(
            &sim,
            replica_topology(&NAMES, Some("db-1"), "new", SOURCE_HOST),
            Some(demoting.clone()),
            &fast_config(),
        )
        .await;

        assert!(matches!(outcome.error, Some(Error::ConfigurationError(_))));
        assert!(!outcome.error.as_ref().unwrap().is_retryable());
        assert_eq!(outcome.record, demoting);
        assert_eq!(outcome.outcome.reason, "InvalidConfiguration");
        assert_eq!(outcome.requeue_after, Duration::from_secs(300));
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_write_leader_blip_never_moves_leadership() {
        let sim = SimulatedCluster::primary(&NAMES, "db-1");
        sim.update("db-1", |s| s.reachable = false);
        let config = fast_config();
        let leader = SwitchStatus {
            phase: SwitchPhase::SteadyPrimary,
            ..Default::default()
        };

        let failed = run_pass(
            &sim,
            primary_topology(&NAMES, Some("db-1")),
            Some(leader),
            &config,
        )
        .await;
        assert_eq!(failed.record.phase, SwitchPhase::Failed);
        assert_eq!(failed.record.failed_during, Some(SwitchPhase::SteadyPrimary));
        assert_eq!(failed.outcome.status, ConditionStatus::Unknown);
        assert_eq!(
            failed.topology.current_primary().map(InstanceId::as_str),
            Some("db-1")
        );

        // Still unreachable: stays failed without touching the standbys
        let still_failed = run_pass(
            &sim,
            failed.topology.clone(),
            Some(failed.record.clone()),
            &config,
        )
        .await;
        assert_eq!(still_failed.record.phase, SwitchPhase::Failed);
        assert_eq!(
            still_failed.topology.current_primary().map(InstanceId::as_str),
            Some("db-1")
        );

        sim.update("db-1", |s| s.reachable = true);
        let outcomes = run_until(
            &sim,
            still_failed.topology.clone(),
            Some(still_failed.record.clone()),
            &config,
            3,
            |o| o.record.phase == SwitchPhase::SteadyPrimary && o.drift == 0,
        )
        .await;

        let restored = outcomes.last().unwrap();
        assert_eq!(restored.record.phase, SwitchPhase::SteadyPrimary);
        assert_eq!(restored.outcome.reason, reasons::CLUSTER_IS_PRIMARY);
        assert_eq!(
            restored.topology.current_primary().map(InstanceId::as_str),
            Some("db-1")
        );
        assert!(!sim.state("db-1").in_recovery);
        assert!(sim.state("db-2").in_recovery);
        assert!(sim.state("db-3").in_recovery);
        assert!(
            sim.commands().iter().all(|c| !c.contains("db-1 ")),
            "{:?}",
            sim.commands()
        );
    }

    #[tokio::test]
    async fn test_failed_primary_does_not_resume_while_leader_in_recovery() {
        let sim = SimulatedCluster::primary(&NAMES, "db-1");
        sim.set("db-1", SimInstance::standby_of(&sim.host("db-2")));
        let failed = SwitchStatus {
            phase: SwitchPhase::Failed,
            failed_during: Some(SwitchPhase::SteadyPrimary),
            attempts: 1,
            ..Default::default()
        };

        let outcome = run_pass(
            &sim,
            primary_topology(&NAMES, Some("db-1")),
            Some(failed),
            &fast_config(),
        )
        .await;

        assert_eq!(outcome.record.phase, SwitchPhase::Failed);
        assert!(matches!(outcome.error, Some(Error::NoEligiblePrimary(_))));
        assert_eq!(
            outcome.topology.current_primary().map(InstanceId::as_str),
            Some("db-1")
        );
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unobservable_promotion_target_is_never_replaced() {
        // db-1 was promoted before it dropped out of sight
        let sim = SimulatedCluster::primary(&NAMES, "db-1");
        sim.update("db-1", |s| s.reachable = false);
        let config = fast_config();
        let promoting = SwitchStatus {
            phase: SwitchPhase::PromotingToPrimary,
            target: Some("db-1".to_string()),
            transition_started_at: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };

        let first = run_pass(&sim, primary_topology(&NAMES, None), Some(promoting), &config).await;
        assert_eq!(first.record.phase, SwitchPhase::PromotingToPrimary);
        assert_eq!(first.record.target.as_deref(), Some("db-1"));
        assert_eq!(first.record.attempts, 1);
        assert_eq!(
            first.topology.current_primary().map(InstanceId::as_str),
            Some("db-1")
        );
        assert!(matches!(first.error, Some(Error::NoEligiblePrimary(_))));
        assert_eq!(first.outcome.reason, reasons::PROMOTION_IN_PROGRESS);

        let outcomes = run_until(
            &sim,
            first.topology.clone(),
            Some(first.record.clone()),
            &config,
            config.switchover.max_attempts as usize,
            |o| o.record.phase == SwitchPhase::Failed,
        )
        .await;
        let failed = outcomes.last().unwrap();
        assert_eq!(failed.record.phase, SwitchPhase::Failed);
        assert_eq!(
            failed.record.failed_during,
            Some(SwitchPhase::PromotingToPrimary)
        );
        assert_eq!(failed.record.target.as_deref(), Some("db-1"));
        assert_eq!(failed.outcome.status, ConditionStatus::Unknown);
        assert!(sim.commands().is_empty());
        assert!(sim.state("db-2").in_recovery);
        assert!(sim.state("db-3").in_recovery);

        sim.update("db-1", |s| s.reachable = true);
        let resumed = run_pass(
            &sim,
            failed.topology.clone(),
            Some(failed.record.clone()),
            &config,
        )
        .await;
        assert_eq!(resumed.record.phase, SwitchPhase::SteadyPrimary);
        assert_eq!(resumed.record.target, None);
        assert_eq!(resumed.events.len(), 1);
        assert_eq!(resumed.events[0].instance, "db-1");
        assert!(sim.commands().is_empty());
        assert!(sim.state("db-2").in_recovery);
    }

    #[tokio::test]
    async fn test_source_change_applies_while_failed_in_steady_replica() {
        const NEW_HOST: &str = "dr-rw.prod.svc";
        let sim = SimulatedCluster::replica(&NAMES, "db-1", SOURCE_HOST);
        let failed = SwitchStatus {
            phase: SwitchPhase::Failed,
            failed_during: Some(SwitchPhase::SteadyReplica),
            source: Some("src".to_string()),
            attempts: 3,
            ..Default::default()
        };

        let outcome = run_pass(
            &sim,
            replica_topology(&NAMES, Some("db-1"), "dr", NEW_HOST),
            Some(failed),
            &fast_config(),
        )
        .await;

        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.record.phase, SwitchPhase::SteadyReplica);
        assert_eq!(outcome.record.source.as_deref(), Some("dr"));
        assert_eq!(outcome.record.attempts, 0);
        assert_eq!(sim.commands(), vec![format!("set_upstream db-1 {}", NEW_HOST)]);
        assert_eq!(sim.state("db-1").upstream.as_deref(), Some(NEW_HOST));
    }
}
