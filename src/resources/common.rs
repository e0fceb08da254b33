//! Common utilities for Kubernetes resource generation
//!
//! Naming, labelling and ownership helpers shared by every factory so that
//! generated objects agree on selectors and carry the ownership marker.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "pgcluster.dev/v1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "pg-cluster-operator";

/// Label identifying the owning cluster
pub const CLUSTER_LABEL: &str = "pgcluster.dev/cluster";

/// Label Patroni sets on each member pod with its current role
pub const ROLE_LABEL: &str = "role";
pub const PRIMARY_ROLE: &str = "primary";
pub const REPLICA_ROLE: &str = "replica";

/// Pod-template annotation carrying the Patroni configuration fingerprint
pub const CONFIG_HASH_ANNOTATION: &str = "pgcluster.dev/config-hash";

/// Name of the database container in every instance pod
pub const PATRONI_CONTAINER: &str = "patroni";

pub const POSTGRES_PORT: i32 = 5432;
pub const PATRONI_PORT: i32 = 8008;

/// Generate an owner reference for a PostgresCluster
///
/// The controller reference is the ownership marker: only objects carrying it
/// are eligible for deletion when they leave the desired set.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Standard labels merged with the user-defined labels from the spec
///
/// User labels cannot override the cluster identifier.
pub fn cluster_labels(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    let name = cluster.name_any();
    let mut labels = standard_labels(&name);

    for (key, value) in &cluster.spec.labels {
        if key != CLUSTER_LABEL {
            labels.insert(key.clone(), value.clone());
        }
    }

    labels
}

/// Labels Patroni uses to discover the members of a cluster
///
/// Must stay in sync with `PATRONI_KUBERNETES_LABELS`.
pub fn patroni_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Selector for pods with the given Patroni role
pub fn role_selector(cluster_name: &str, role: &str) -> BTreeMap<String, String> {
    let mut labels = patroni_labels(cluster_name);
    labels.insert(ROLE_LABEL.to_string(), role.to_string());
    labels
}

/// Label selector string listing every object a cluster owns
pub fn owned_selector(cluster_name: &str) -> String {
    format!(
        "app.kubernetes.io/managed-by={},{}={}",
        FIELD_MANAGER, CLUSTER_LABEL, cluster_name
    )
}

/// Label selector string matching the instance pods of a cluster
pub fn instance_selector(cluster_name: &str) -> String {
    patroni_labels(cluster_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Object names derived from the cluster name
pub mod names {
    /// StatefulSet, Patroni scope and the selectorless primary service
    pub fn patroni(cluster: &str) -> String {
        cluster.to_string()
    }

    pub fn patroni_config(cluster: &str) -> String {
        format!("{}-patroni", cluster)
    }

    /// ServiceAccount, Role and RoleBinding
    pub fn patroni_role(cluster: &str) -> String {
        format!("{}-patroni", cluster)
    }

    /// Headless service governing the StatefulSet
    pub fn config_service(cluster: &str) -> String {
        format!("{}-config", cluster)
    }

    pub fn rest_service(cluster: &str) -> String {
        format!("{}-rest", cluster)
    }

    pub fn primary_service(cluster: &str) -> String {
        format!("{}-primary", cluster)
    }

    pub fn replicas_service(cluster: &str) -> String {
        format!("{}-replicas", cluster)
    }

    pub fn disruption_budget(cluster: &str) -> String {
        format!("{}-pdb", cluster)
    }

    /// Pod name of the instance with the given ordinal
    pub fn instance(cluster: &str, ordinal: u32) -> String {
        format!("{}-{}", cluster, ordinal)
    }
}
