//! Cluster reconciliation against an in-memory API server

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use serde_json::{Value, json};

use pg_cluster_operator::controller::{BackoffConfig, Error, reconcile};
use pg_cluster_operator::crd::{ClusterPhase, Condition, PostgresCluster};
use pg_cluster_operator::resources::ObjectKey;

use crate::common::*;

fn harness_with(cluster: &PostgresCluster) -> Harness {
    let harness = Harness::new(FakeInstanceOps::default());
    harness.store.put_cluster(cluster.clone());
    harness
}

/// Run one pass with the cluster as currently stored
async fn pass(harness: &Harness, name: &str) -> pg_cluster_operator::Result<Action> {
    let cluster = harness.store.cluster("default", name).unwrap();
    reconcile(Arc::new(cluster), harness.ctx.clone()).await
}

fn key(kind: &str, name: &str) -> ObjectKey {
    ObjectKey::new(kind, "default", name)
}

fn condition<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
    conditions.iter().find(|c| c.type_ == type_).unwrap()
}

fn owned_payload(name: &str, owner_uid: Option<&str>) -> Value {
    let mut payload = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": {
                "app.kubernetes.io/managed-by": "pg-cluster-operator",
                "pgcluster.dev/cluster": "db"
            }
        },
        "data": {"leftover": "true"}
    });
    if let Some(uid) = owner_uid {
        payload["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "pgcluster.dev/v1",
            "kind": "PostgresCluster",
            "name": "db",
            "uid": uid,
            "controller": true
        }]);
    }
    payload
}

fn verbs(harness: &Harness) -> Vec<(String, String)> {
    harness
        .api
        .writes()
        .into_iter()
        .map(|(verb, key)| (verb, format!("{}/{}", key.kind, key.name)))
        .collect()
}

mod convergence_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_pass_creates_everything() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);

        let action = pass(&harness, "db").await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        let writes = harness.api.writes();
        assert_eq!(writes.len(), 12);
        assert!(writes.iter().all(|(verb, _)| verb == "create"));

        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Reconciled);
        assert_eq!(status.instances, 3);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(condition(&status.conditions, "Ready").status, "True");
        assert_eq!(condition(&status.conditions, "ConfigurationValid").status, "True");

        assert_eq!(harness.events.reasons(), vec!["ClusterCreated"]);
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);

        pass(&harness, "db").await.unwrap();
        harness.api.clear_writes();

        pass(&harness, "db").await.unwrap();
        assert!(harness.api.writes().is_empty());
        // Nothing applied, nothing announced
        assert_eq!(harness.events.reasons(), vec!["ClusterCreated"]);
    }

    #[tokio::test]
    async fn test_server_filled_pod_defaults_are_not_drift() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        pass(&harness, "db").await.unwrap();

        harness.api.edit(&key("StatefulSet", "db"), |p| {
            let pod = &mut p["spec"]["template"]["spec"];
            pod["serviceAccount"] = pod["serviceAccountName"].clone();
            pod["containers"][0]["resources"] = json!({});
        });
        harness.api.clear_writes();

        pass(&harness, "db").await.unwrap();
        assert!(harness.api.writes().is_empty());
        assert_eq!(harness.events.reasons(), vec!["ClusterCreated"]);
    }

    #[tokio::test]
    async fn test_drift_is_patched() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        pass(&harness, "db").await.unwrap();
        harness.api.clear_writes();

        harness
            .api
            .edit(&key("StatefulSet", "db"), |p| p["spec"]["replicas"] = json!(5));
        pass(&harness, "db").await.unwrap();

        assert_eq!(
            verbs(&harness),
            vec![("patch".to_string(), "StatefulSet/db".to_string())]
        );
        let live = harness.api.object(&key("StatefulSet", "db")).unwrap();
        assert_eq!(live.payload["spec"]["replicas"], 3);
        assert_eq!(harness.events.reasons().last().unwrap(), "ClusterUpdated");
    }

    #[tokio::test]
    async fn test_patroni_leader_state_is_left_alone() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        pass(&harness, "db").await.unwrap();
        harness.api.clear_writes();

        harness.api.edit(&key("Endpoints", "db"), |p| {
            p["metadata"]["annotations"] = json!({"leader": "db-1"});
            p["subsets"] = json!([{"addresses": [{"ip": "10.0.0.7"}]}]);
        });
        pass(&harness, "db").await.unwrap();
        assert!(harness.api.writes().is_empty());
    }

    #[tokio::test]
    async fn test_stale_owned_objects_are_deleted() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        harness
            .api
            .seed(key("ConfigMap", "db-old"), owned_payload("db-old", Some(TEST_UID)));
        harness
            .api
            .seed(key("ConfigMap", "db-foreign"), owned_payload("db-foreign", None));
        harness.api.seed(
            key("ConfigMap", "db-other-owner"),
            owned_payload("db-other-owner", Some("another-uid")),
        );

        pass(&harness, "db").await.unwrap();

        let writes = verbs(&harness);
        assert!(writes.contains(&("delete".to_string(), "ConfigMap/db-old".to_string())));
        // Deletes run after every create and patch
        assert_eq!(writes.last().unwrap().0, "delete");
        assert!(harness.api.object(&key("ConfigMap", "db-old")).is_none());
        assert!(harness.api.object(&key("ConfigMap", "db-foreign")).is_some());
        assert!(harness.api.object(&key("ConfigMap", "db-other-owner")).is_some());
    }

    #[tokio::test]
    async fn test_scale_down_to_one_removes_budget() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        pass(&harness, "db").await.unwrap();
        assert!(harness.api.object(&key("PodDisruptionBudget", "db-pdb")).is_some());
        harness.api.clear_writes();

        let mut scaled = harness.store.cluster("default", "db").unwrap();
        scaled.spec.instances = 1;
        scaled.metadata.generation = Some(2);
        harness.store.put_cluster(scaled);
        pass(&harness, "db").await.unwrap();

        let writes = verbs(&harness);
        assert!(writes.contains(&("patch".to_string(), "StatefulSet/db".to_string())));
        assert!(writes.contains(&("delete".to_string(), "PodDisruptionBudget/db-pdb".to_string())));
        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.instances, 1);
    }

    #[tokio::test]
    async fn test_operator_version_upgrade_migrates_layout() {
        let cluster = PostgresClusterBuilder::ha("db", "default")
            .with_uid(TEST_UID)
            .with_operator_version("1.0")
            .build();
        let harness = harness_with(&cluster);
        pass(&harness, "db").await.unwrap();
        assert_eq!(harness.api.writes().len(), 8);
        harness.api.clear_writes();

        let mut upgraded = harness.store.cluster("default", "db").unwrap();
        upgraded
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert("pgcluster.dev/operator-version".to_string(), "1.2".to_string());
        harness.store.put_cluster(upgraded);
        pass(&harness, "db").await.unwrap();

        let writes = verbs(&harness);
        for created in [
            "Service/db",
            "Endpoints/db",
            "Service/db-rest",
            "PodDisruptionBudget/db-pdb",
        ] {
            assert!(
                writes.contains(&("create".to_string(), created.to_string())),
                "{} not created",
                created
            );
        }
        assert!(writes.contains(&("patch".to_string(), "Service/db-primary".to_string())));
        assert!(writes.contains(&("patch".to_string(), "ConfigMap/db-patroni".to_string())));
        assert!(writes.iter().all(|(verb, _)| verb != "delete"));

        let primary = harness.api.object(&key("Service", "db-primary")).unwrap();
        assert_eq!(primary.payload["spec"]["type"], "ExternalName");
    }

    #[tokio::test]
    async fn test_referenced_postgres_config_is_merged() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_uid(TEST_UID)
            .with_postgres_config("pg-tuning")
            .build();
        let harness = harness_with(&cluster);
        harness.api.seed(
            key("ConfigMap", "pg-tuning"),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "pg-tuning", "namespace": "default"},
                "data": {"work_mem": "64MB"}
            }),
        );

        pass(&harness, "db").await.unwrap();

        let config = harness.api.object(&key("ConfigMap", "db-patroni")).unwrap();
        let spilo = config.payload["data"]["SPILO_CONFIGURATION"].as_str().unwrap();
        assert!(spilo.contains("\"work_mem\":\"64MB\""));
        // Not labelled as ours, so never a deletion candidate
        assert!(harness.api.object(&key("ConfigMap", "pg-tuning")).is_some());
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_not_reconciled() {
        let mut cluster = create_test_cluster("db", "default", 3);
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::chrono::Utc::now()),
        );
        let harness = harness_with(&cluster);

        let action = pass(&harness, "db").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(harness.api.writes().is_empty());
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_object_degrades_cluster() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        harness.api.break_object(key("Service", "db-replicas"));

        let action = pass(&harness, "db").await.unwrap();
        assert_eq!(action, Action::requeue(BackoffConfig::default().initial_delay));

        // Every other object was still written
        assert_eq!(harness.api.writes().len(), 11);
        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Degraded);
        assert_eq!(condition(&status.conditions, "Degraded").status, "True");
        assert_eq!(condition(&status.conditions, "Ready").status, "False");

        let failed: Vec<_> = harness
            .events
            .events()
            .into_iter()
            .filter(|e| e.reason == "ApplyFailed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].warning);
        assert!(failed[0].note.as_ref().unwrap().contains("db-replicas"));
    }

    #[tokio::test]
    async fn test_unknown_operator_version_fails_cluster() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_uid(TEST_UID)
            .with_operator_version("0.9")
            .build();
        let harness = harness_with(&cluster);

        let result = pass(&harness, "db").await;
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
        assert!(harness.api.writes().is_empty());

        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Failed);
        assert_eq!(condition(&status.conditions, "ConfigurationValid").status, "False");

        let events = harness.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "ClusterConfigFailed");
        assert!(events[0].warning);
    }

    #[tokio::test]
    async fn test_invalid_spec_fails_cluster() {
        let cluster = create_test_cluster("db", "default", 0);
        let harness = harness_with(&cluster);

        let result = pass(&harness, "db").await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert!(harness.api.writes().is_empty());
        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Failed);
    }

    #[tokio::test]
    async fn test_generation_failure_survives_status_write_failure() {
        let cluster = create_test_cluster("db", "default", 0);
        let harness = harness_with(&cluster);
        harness.store.fail_next_status_writes(10);

        let result = pass(&harness, "db").await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        assert!(harness.store.cluster("default", "db").unwrap().status.is_none());

        // Recorded once the store accepts writes again
        harness.store.fail_next_status_writes(0);
        let result = pass(&harness, "db").await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Failed);
    }

    #[tokio::test]
    async fn test_missing_postgres_config_fails_cluster() {
        let cluster = PostgresClusterBuilder::new("db", "default")
            .with_uid(TEST_UID)
            .with_postgres_config("does-not-exist")
            .build();
        let harness = harness_with(&cluster);

        let result = pass(&harness, "db").await;
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
        assert_eq!(harness.events.reasons(), vec!["ClusterConfigFailed"]);
    }

    #[tokio::test]
    async fn test_conflict_aborts_pass_and_next_pass_converges() {
        let cluster = create_test_cluster("db", "default", 3);
        let harness = harness_with(&cluster);
        harness.api.conflict_on(key("Service", "db-config"));

        let result = pass(&harness, "db").await;
        let err = result.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        // Status is only written once a pass completes
        assert!(harness.store.cluster("default", "db").unwrap().status.is_none());

        pass(&harness, "db").await.unwrap();
        assert_eq!(harness.api.keys().len(), 12);
        let status = harness.store.cluster("default", "db").unwrap().status.unwrap();
        assert_eq!(status.phase, ClusterPhase::Reconciled);
    }
}
