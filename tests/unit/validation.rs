//! Unit tests for PostgresCluster spec validation

use replica_switch_operator::controller::error::Error;
use replica_switch_operator::controller::validation::{MAX_INSTANCES, MIN_INSTANCES, validate_spec};

use crate::common::*;

fn assert_configuration_error(result: Result<(), Error>) {
    match result {
        Err(e @ Error::ConfigurationError(_)) => assert!(!e.is_retryable()),
        other => panic!("expected configuration error, got {:?}", other),
    }
}

mod instance_count {
    use super::*;

    #[test]
    fn test_bounds_are_inclusive() {
        for instances in [MIN_INSTANCES, MAX_INSTANCES] {
            let cluster = PostgresClusterBuilder::new("db", "default")
                .with_instances(instances)
                .build();
            assert!(validate_spec(&cluster).is_ok(), "{} instances", instances);
        }
    }

    #[test]
    fn test_out_of_range_counts_rejected() {
        for instances in [MIN_INSTANCES - 1, -3, MAX_INSTANCES + 1] {
            let cluster = PostgresClusterBuilder::new("db", "default")
                .with_instances(instances)
                .build();
            assert_configuration_error(validate_spec(&cluster));
        }
    }
}

mod replica_source {
    use super::*;

    #[test]
    fn test_declared_replica_cluster_is_valid() {
        let cluster = PostgresClusterBuilder::replica("db", "default", "src", "src-rw.prod.svc")
            .with_instances(3)
            .build();
        assert!(validate_spec(&cluster).is_ok());
    }

    #[test]
    fn test_undefined_source_rejected() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_external_cluster("other", "other-rw")
            .with_replica("src", true)
            .build();
        assert_configuration_error(validate_spec(&cluster));
    }

    #[test]
    fn test_undefined_source_rejected_while_disabled() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_replica("src", false)
            .build();
        assert_configuration_error(validate_spec(&cluster));
    }

    #[test]
    fn test_blank_host_rejected() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_external_cluster("src", "  ")
            .with_replica("src", true)
            .build();
        assert_configuration_error(validate_spec(&cluster));
    }
}

mod external_clusters {
    use super::*;

    #[test]
    fn test_duplicate_names_rejected() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_external_cluster("src", "a-rw")
            .with_external_cluster("src", "b-rw")
            .build();
        assert_configuration_error(validate_spec(&cluster));
    }

    #[test]
    fn test_unnamed_entry_rejected() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_external_cluster("", "a-rw")
            .build();
        assert_configuration_error(validate_spec(&cluster));
    }

    #[test]
    fn test_unused_external_clusters_allowed() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_external_cluster("dr-east", "east-rw")
            .with_external_cluster("dr-west", "west-rw")
            .build();
        assert!(validate_spec(&cluster).is_ok());
    }
}
