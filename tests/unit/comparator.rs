//! Unit tests for desired/live comparison of generated objects
//!
//! Live copies are built from the generated payload plus what the API server
//! and Patroni add on their own.

use serde_json::{Value, json};

use pg_cluster_operator::controller::ComparatorSet;
use pg_cluster_operator::controller::comparator::{Comparator, IgnoreRule, PatchOp};
use pg_cluster_operator::crd::OperatorVersion;
use pg_cluster_operator::resources::{
    DesiredObject, FactoryRegistry, GenerationContext, LiveObject,
};

use crate::common::*;

fn generated(kind: &str, name: &str) -> DesiredObject {
    let cluster = create_test_cluster("db", "default", 3);
    FactoryRegistry::standard()
        .generate(&GenerationContext::new(&cluster, OperatorVersion::LATEST))
        .unwrap()
        .into_iter()
        .find(|o| o.key.kind == kind && o.key.name == name)
        .unwrap()
}

fn as_live(desired: &DesiredObject, edit: impl FnOnce(&mut Value)) -> LiveObject {
    let mut payload = desired.payload.clone();
    payload["metadata"]["uid"] = json!("0b7c2d9e");
    payload["metadata"]["resourceVersion"] = json!("4211");
    payload["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
    payload["metadata"]["managedFields"] = json!([{"manager": "pg-cluster-operator"}]);
    edit(&mut payload);
    LiveObject {
        key: desired.key.clone(),
        resource_version: Some("4211".to_string()),
        payload,
    }
}

mod server_defaults_tests {
    use super::*;

    #[test]
    fn test_untouched_copy_is_unchanged() {
        let set = ComparatorSet::standard().unwrap();
        for (kind, name) in [
            ("ConfigMap", "db-patroni"),
            ("StatefulSet", "db"),
            ("Service", "db-replicas"),
            ("PodDisruptionBudget", "db-pdb"),
        ] {
            let desired = generated(kind, name);
            let live = as_live(&desired, |_| {});
            assert!(!set.has_changed(&desired, &live), "{} {}", kind, name);
        }
    }

    #[test]
    fn test_service_allocations_are_ignored() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("Service", "db-replicas");
        let live = as_live(&desired, |p| {
            p["spec"]["clusterIP"] = json!("10.96.0.12");
            p["spec"]["clusterIPs"] = json!(["10.96.0.12"]);
            p["spec"]["sessionAffinity"] = json!("None");
            p["spec"]["ipFamilies"] = json!(["IPv4"]);
            p["spec"]["ipFamilyPolicy"] = json!("SingleStack");
            p["status"] = json!({"loadBalancer": {}});
        });
        assert!(!set.has_changed(&desired, &live));
    }

    #[test]
    fn test_statefulset_defaults_are_ignored() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("StatefulSet", "db");
        let live = as_live(&desired, |p| {
            p["spec"]["revisionHistoryLimit"] = json!(10);
            p["spec"]["template"]["spec"]["dnsPolicy"] = json!("ClusterFirst");
            p["spec"]["template"]["spec"]["restartPolicy"] = json!("Always");
            p["spec"]["template"]["spec"]["schedulerName"] = json!("default-scheduler");
            p["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] =
                json!("/dev/termination-log");
            p["spec"]["template"]["spec"]["containers"][0]["env"][0]["valueFrom"]["fieldRef"]
                ["apiVersion"] = json!("v1");
            p["status"] = json!({"replicas": 3, "readyReplicas": 3});
        });
        assert!(!set.has_changed(&desired, &live));
    }

    #[test]
    fn test_patroni_endpoint_state_is_ignored() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("Endpoints", "db");
        let live = as_live(&desired, |p| {
            p["metadata"]["annotations"] = json!({"leader": "db-0", "optime": "67108960"});
            p["subsets"] = json!([{
                "addresses": [{"ip": "10.0.0.5", "hostname": "db-0"}],
                "ports": [{"name": "postgresql", "port": 5432}]
            }]);
        });
        assert!(!set.has_changed(&desired, &live));
    }

    #[test]
    fn test_service_account_token_secrets_are_ignored() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("ServiceAccount", "db-patroni");
        let live = as_live(&desired, |p| {
            p["secrets"] = json!([{"name": "db-patroni-token-x7k2q"}]);
        });
        assert!(!set.has_changed(&desired, &live));
    }
}

mod drift_tests {
    use super::*;

    #[test]
    fn test_replica_count_drift_is_detected() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("StatefulSet", "db");
        let live = as_live(&desired, |p| p["spec"]["replicas"] = json!(1));
        assert!(set.has_changed(&desired, &live));
    }

    #[test]
    fn test_service_type_drift_is_detected() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("Service", "db-replicas");
        let live = as_live(&desired, |p| p["spec"]["type"] = json!("NodePort"));
        assert!(set.has_changed(&desired, &live));
    }

    #[test]
    fn test_removed_label_is_detected() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("ConfigMap", "db-patroni");
        let live = as_live(&desired, |p| {
            p["metadata"]["labels"]
                .as_object_mut()
                .unwrap()
                .remove("pgcluster.dev/cluster");
        });
        assert!(set.has_changed(&desired, &live));
    }

    #[test]
    fn test_changed_annotation_is_detected() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("StatefulSet", "db");
        let live = as_live(&desired, |p| {
            p["spec"]["template"]["metadata"]["annotations"]["pgcluster.dev/config-hash"] =
                json!("stale");
        });
        assert!(set.has_changed(&desired, &live));
    }

    #[test]
    fn test_endpoints_rules_do_not_leak_into_services() {
        let set = ComparatorSet::standard().unwrap();
        let desired = generated("Service", "db");
        let live = as_live(&desired, |p| {
            p["subsets"] = json!([{"addresses": [{"ip": "10.0.0.5"}]}]);
        });
        assert!(set.has_changed(&desired, &live));
    }
}

mod override_tests {
    use super::*;

    #[test]
    fn test_kind_comparator_can_be_replaced() {
        let standard = ComparatorSet::standard().unwrap();
        let relaxed: Comparator = standard
            .for_kind("Service")
            .clone()
            .with_rules([IgnoreRule::new(r"^/spec/type$", PatchOp::Any).unwrap()]);
        let set = standard.with_comparator("Service", relaxed);

        let desired = generated("Service", "db-replicas");
        let live = as_live(&desired, |p| p["spec"]["type"] = json!("NodePort"));
        assert!(!set.has_changed(&desired, &live));

        // Other kinds keep their comparators
        let desired = generated("ConfigMap", "db-patroni");
        let live = as_live(&desired, |p| p["data"] = json!({}));
        assert!(set.has_changed(&desired, &live));
    }
}
