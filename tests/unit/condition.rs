//! Unit tests for switch condition reporting

use chrono::{DateTime, Duration, Utc};
use replica_switch_operator::controller::condition::{
    ConditionReporter, ConditionStatus, REPLICA_CLUSTER_SWITCH, SwitchOutcome, condition_applies,
    reasons, timestamp,
};
use replica_switch_operator::controller::error::Error;
use replica_switch_operator::crd::{Condition, PostgresClusterStatus, SwitchPhase};

use crate::common::*;

fn stored_condition(type_: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: reasons::CLUSTER_IS_REPLICA.to_string(),
        message: "Cluster is acting as replica".to_string(),
        last_transition_time: "2026-01-01T00:00:00+00:00".to_string(),
        observed_generation: Some(1),
    }
}

mod applicability {
    use super::*;

    #[test]
    fn test_primary_cluster_without_replica_block() {
        let cluster = PostgresClusterBuilder::new("db", "default").build();
        assert!(!condition_applies(&cluster));
    }

    #[test]
    fn test_replica_block_enables_condition() {
        let cluster = PostgresClusterBuilder::replica("db", "default", "src", "src-rw").build();
        assert!(condition_applies(&cluster));

        // A disabled block still declares the cluster as switchable
        let disabled = PostgresClusterBuilder::new("db", "default")
            .with_external_cluster("src", "src-rw")
            .with_replica("src", false)
            .build();
        assert!(condition_applies(&disabled));
    }

    #[test]
    fn test_condition_kept_after_replica_block_removed() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_status(PostgresClusterStatus {
                conditions: vec![stored_condition(REPLICA_CLUSTER_SWITCH)],
                ..Default::default()
            })
            .build();
        assert!(condition_applies(&cluster));
    }

    #[test]
    fn test_unrelated_conditions_do_not_count() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_status(PostgresClusterStatus {
                conditions: vec![stored_condition("Ready")],
                ..Default::default()
            })
            .build();
        assert!(!condition_applies(&cluster));
    }
}

mod reporter {
    use super::*;

    #[test]
    fn test_other_conditions_are_preserved() {
        let now = Utc::now();
        let mut reporter = ConditionReporter::from_existing(vec![stored_condition("Ready")], Some(2));
        let outcome = SwitchOutcome::steady(SwitchPhase::SteadyPrimary, Some("db-1"));

        assert!(reporter.set_condition(&outcome, now));
        let conditions = reporter.build();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "Ready");
        assert_eq!(conditions[1].type_, REPLICA_CLUSTER_SWITCH);
        assert_eq!(conditions[1].observed_generation, Some(2));
    }

    #[test]
    fn test_reason_change_with_same_status_bumps_time() {
        let first = Utc::now();
        let mut reporter = ConditionReporter::from_existing(vec![], Some(1));
        reporter.set_condition(&SwitchOutcome::steady(SwitchPhase::SteadyReplica, None), first);

        let later = first + Duration::seconds(20);
        reporter.set_condition(&SwitchOutcome::steady(SwitchPhase::SteadyPrimary, None), later);

        let condition = reporter.current().unwrap();
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, reasons::CLUSTER_IS_PRIMARY);
        assert_eq!(condition.last_transition_time, timestamp(later));
    }

    #[test]
    fn test_transition_time_uses_kubernetes_time_format() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.891234+02:00")
            .unwrap()
            .with_timezone(&Utc);
        let mut reporter = ConditionReporter::from_existing(vec![], Some(1));
        reporter.set_condition(&SwitchOutcome::steady(SwitchPhase::SteadyReplica, None), at);

        assert_eq!(
            reporter.current().unwrap().last_transition_time,
            "2026-03-04T03:06:07Z"
        );
    }

    #[test]
    fn test_transition_times_are_monotonic_across_outcomes() {
        let start = Utc::now();
        let mut reporter = ConditionReporter::from_existing(vec![], Some(1));
        let outcomes = [
            SwitchOutcome::steady(SwitchPhase::SteadyReplica, Some("db-1")),
            SwitchOutcome::in_progress(SwitchPhase::PromotingToPrimary, "promoting db-1"),
            SwitchOutcome::failed(&Error::NoEligiblePrimary("no healthy instance".into())),
            SwitchOutcome::steady(SwitchPhase::SteadyPrimary, Some("db-2")),
        ];
        // Clock skew: the third write happens "before" the second
        let offsets = [0, 10, 5, 30];

        let mut last = start - Duration::seconds(1);
        for (outcome, offset) in outcomes.iter().zip(offsets) {
            reporter.set_condition(outcome, start + Duration::seconds(offset));
            let stored = &reporter.current().unwrap().last_transition_time;
            let time = DateTime::parse_from_rfc3339(stored).unwrap().with_timezone(&Utc);
            assert!(time >= last, "{} went back to {}", last, time);
            last = time;
        }
    }

    #[test]
    fn test_in_progress_reasons() {
        let promoting = SwitchOutcome::in_progress(SwitchPhase::PromotingToPrimary, "");
        assert_eq!(promoting.status, ConditionStatus::False);
        assert_eq!(promoting.reason, reasons::PROMOTION_IN_PROGRESS);

        let demoting = SwitchOutcome::in_progress(SwitchPhase::DemotingToReplica, "");
        assert_eq!(demoting.reason, reasons::DEMOTION_IN_PROGRESS);
    }
}
