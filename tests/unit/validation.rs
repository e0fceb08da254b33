//! Unit tests for validation logic

use pg_cluster_operator::controller::{Error, MAX_INSTANCES, MIN_INSTANCES, validate_spec};
use pg_cluster_operator::crd::RestoreSpec;

use crate::common::*;

mod instance_count_tests {
    use super::*;

    #[test]
    fn test_bounds_are_inclusive() {
        for instances in [MIN_INSTANCES, 3, MAX_INSTANCES] {
            let cluster = create_test_cluster("db", "default", instances);
            assert!(validate_spec(&cluster).is_ok(), "{} instances", instances);
        }
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        for instances in [-1, MIN_INSTANCES - 1, MAX_INSTANCES + 1] {
            let cluster = create_test_cluster("db", "default", instances);
            let err = validate_spec(&cluster).unwrap_err();
            assert!(matches!(err, Error::ValidationError(_)), "{} instances", instances);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_message_names_the_limit() {
        let cluster = create_test_cluster("db", "default", MAX_INSTANCES + 5);
        let message = validate_spec(&cluster).unwrap_err().to_string();
        assert!(message.contains(&MAX_INSTANCES.to_string()));
    }
}

mod storage_tests {
    use super::*;

    #[test]
    fn test_accepted_units() {
        for size in ["512Mi", "10Gi", "2Ti"] {
            let cluster = PostgresClusterBuilder::new("db", "default")
                .with_storage(size, None)
                .build();
            assert!(validate_spec(&cluster).is_ok(), "{}", size);
        }
    }

    #[test]
    fn test_rejected_sizes() {
        for size in ["10", "10GB", "Gi", "0Gi", "1.5Gi", "-3Gi"] {
            let cluster = PostgresClusterBuilder::new("db", "default")
                .with_storage(size, None)
                .build();
            assert!(validate_spec(&cluster).is_err(), "{}", size);
        }
    }
}

mod version_tests {
    use super::*;

    #[test]
    fn test_major_and_minor_versions() {
        for version in ["15", "16", "16.4", " 17 "] {
            let cluster = PostgresClusterBuilder::new("db", "default")
                .with_version(version)
                .build();
            assert!(validate_spec(&cluster).is_ok(), "{:?}", version);
        }
    }

    #[test]
    fn test_non_numeric_versions() {
        for version in ["", "latest", "v16", ".4"] {
            let cluster = PostgresClusterBuilder::new("db", "default")
                .with_version(version)
                .build();
            assert!(validate_spec(&cluster).is_err(), "{:?}", version);
        }
    }
}

mod restore_tests {
    use super::*;

    fn with_restore(from_backup: &str, point_in_time: Option<&str>) -> pg_cluster_operator::crd::PostgresCluster {
        let mut cluster = create_test_cluster("db", "default", 2);
        cluster.spec.restore = Some(RestoreSpec {
            from_backup: from_backup.to_string(),
            point_in_time: point_in_time.map(str::to_string),
        });
        cluster
    }

    #[test]
    fn test_restore_without_target_time() {
        assert!(validate_spec(&with_restore("nightly", None)).is_ok());
    }

    #[test]
    fn test_restore_with_offset_time() {
        assert!(validate_spec(&with_restore("nightly", Some("2024-05-01T12:00:00+02:00"))).is_ok());
    }

    #[test]
    fn test_restore_needs_backup_name() {
        assert!(validate_spec(&with_restore("  ", None)).is_err());
    }

    #[test]
    fn test_restore_time_must_be_rfc3339() {
        for target in ["yesterday", "2024-05-01", "2024-05-01 12:00:00"] {
            let err = validate_spec(&with_restore("nightly", Some(target))).unwrap_err();
            assert!(err.to_string().contains("pointInTime"), "{}", target);
        }
    }
}
