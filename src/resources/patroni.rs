//! Patroni-based PostgreSQL HA resources
//!
//! Generates the configuration, RBAC and StatefulSet for a Patroni cluster.
//! Patroni uses the Kubernetes API as its DCS: leader election goes through
//! the Endpoints object named after the scope, and each member publishes its
//! role in the `role` label and its state in the `status` annotation of its
//! own pod.
//!
//! Reference: https://github.com/patroni/patroni

use std::collections::BTreeMap;

use chrono::DateTime;
use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar,
    EnvVarSource, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretEnvSource, SecretKeySelector,
    ServiceAccount, VolumeMount, VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::controller::error::{Error, Result};
use crate::crd::{OperatorVersion, PostgresCluster, ResourceList};
use crate::resources::common::{
    CLUSTER_LABEL, CONFIG_HASH_ANNOTATION, PATRONI_CONTAINER, PATRONI_PORT, POSTGRES_PORT,
    ROLE_LABEL, cluster_labels, names, owner_reference, patroni_labels,
};
use crate::resources::desired::DesiredObject;
use crate::resources::registry::GenerationContext;

/// Spilo image tag used when the spec does not name an image
const SPILO_TAG: &str = "3.3-p1";

const DATA_MOUNT: &str = "/var/lib/postgresql/data";
const PGDATA: &str = "/var/lib/postgresql/data/pgdata";

/// Baseline postgresql.conf parameters, overridable by the user
fn default_parameters() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("max_connections".to_string(), "100".to_string()),
        ("shared_buffers".to_string(), "128MB".to_string()),
        ("wal_level".to_string(), "replica".to_string()),
        ("hot_standby".to_string(), "on".to_string()),
        ("max_wal_senders".to_string(), "10".to_string()),
        ("max_replication_slots".to_string(), "10".to_string()),
        ("wal_keep_size".to_string(), "1GB".to_string()),
    ])
}

/// Image every instance is expected to run
pub fn image(cluster: &PostgresCluster) -> String {
    cluster.spec.postgres.image.clone().unwrap_or_else(|| {
        format!(
            "ghcr.io/zalando/spilo-{}:{}",
            cluster.spec.postgres.version, SPILO_TAG
        )
    })
}

/// What a compliant instance looks like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTemplate {
    pub image: String,
    pub config_hash: String,
}

/// Desired image and configuration fingerprint for the cluster's instances
pub fn instance_template(ctx: &GenerationContext<'_>) -> Result<InstanceTemplate> {
    let data = patroni_config_data(ctx, ConfigLayout::for_version(ctx.version))?;
    Ok(InstanceTemplate {
        image: image(ctx.cluster),
        config_hash: config_fingerprint(&data),
    })
}

/// SHA-256 over the sorted configuration entries
pub fn config_fingerprint(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Shape of the Patroni configuration map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigLayout {
    /// Inline parameters only
    Legacy,
    /// Adds the log level and merges the referenced postgres configuration
    Current,
}

impl ConfigLayout {
    fn for_version(version: OperatorVersion) -> Self {
        if version >= OperatorVersion::V1_2 {
            ConfigLayout::Current
        } else {
            ConfigLayout::Legacy
        }
    }
}

fn patroni_config_data(
    ctx: &GenerationContext<'_>,
    layout: ConfigLayout,
) -> Result<BTreeMap<String, String>> {
    let cluster = ctx.cluster;
    let name = ctx.name();
    let patroni = &cluster.spec.configuration.patroni;

    let mut parameters = default_parameters();
    if layout == ConfigLayout::Current
        && let Some(referenced) = ctx.postgres_config
    {
        parameters.extend(referenced.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    parameters.extend(
        cluster
            .spec
            .postgres
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let spilo_configuration = json!({
        "bootstrap": {
            "dcs": {
                "ttl": patroni.ttl,
                "loop_wait": patroni.loop_wait,
                "retry_timeout": patroni.retry_timeout,
                "maximum_lag_on_failover": patroni.maximum_lag_on_failover,
                "postgresql": {
                    "use_pg_rewind": true,
                    "use_slots": true,
                    "parameters": parameters,
                }
            }
        }
    });

    let mut data = BTreeMap::from([
        ("PATRONI_SCOPE".to_string(), names::patroni(&name)),
        ("PATRONI_KUBERNETES_NAMESPACE".to_string(), ctx.namespace()),
        (
            "PATRONI_KUBERNETES_LABELS".to_string(),
            serde_json::to_string(&patroni_labels(&name))?,
        ),
        (
            "PATRONI_KUBERNETES_SCOPE_LABEL".to_string(),
            CLUSTER_LABEL.to_string(),
        ),
        (
            "PATRONI_KUBERNETES_ROLE_LABEL".to_string(),
            ROLE_LABEL.to_string(),
        ),
        (
            "PATRONI_KUBERNETES_USE_ENDPOINTS".to_string(),
            "true".to_string(),
        ),
        (
            "PATRONI_KUBERNETES_PORTS".to_string(),
            json!([{"name": "postgresql", "port": POSTGRES_PORT}]).to_string(),
        ),
        (
            "PATRONI_RESTAPI_LISTEN".to_string(),
            format!("0.0.0.0:{}", PATRONI_PORT),
        ),
        (
            "PATRONI_POSTGRESQL_LISTEN".to_string(),
            format!("0.0.0.0:{}", POSTGRES_PORT),
        ),
        ("PATRONI_POSTGRESQL_DATA_DIR".to_string(), PGDATA.to_string()),
        ("PGVERSION".to_string(), cluster.spec.postgres.version.clone()),
        (
            "SPILO_CONFIGURATION".to_string(),
            serde_json::to_string(&spilo_configuration)?,
        ),
    ]);

    if layout == ConfigLayout::Current {
        data.insert("PATRONI_LOG_LEVEL".to_string(), "INFO".to_string());
    }

    if let Some(backup) = &cluster.spec.backup {
        data.insert("USE_WALG_BACKUP".to_string(), "true".to_string());
        data.insert("BACKUP_SCHEDULE".to_string(), backup.schedule.clone());
        data.insert(
            "BACKUP_NUM_TO_RETAIN".to_string(),
            backup.retention.to_string(),
        );
    }

    Ok(data)
}

fn config_map(ctx: &GenerationContext<'_>, layout: ConfigLayout) -> Result<ConfigMap> {
    let name = ctx.name();
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(names::patroni_config(&name)),
            namespace: Some(ctx.namespace()),
            labels: Some(cluster_labels(ctx.cluster)),
            owner_references: Some(vec![owner_reference(ctx.cluster)]),
            ..Default::default()
        },
        data: Some(patroni_config_data(ctx, layout)?),
        ..Default::default()
    })
}

/// Patroni configuration for operator versions before 1.2
pub fn legacy_config_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    Ok(vec![DesiredObject::from_resource(&config_map(
        ctx,
        ConfigLayout::Legacy,
    )?)?])
}

/// Patroni configuration from operator version 1.2
pub fn config_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    Ok(vec![DesiredObject::from_resource(&config_map(
        ctx,
        ConfigLayout::Current,
    )?)?])
}

/// ServiceAccount, Role and RoleBinding used by the Patroni pods
pub fn rbac_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    Ok(vec![
        DesiredObject::from_resource(&generate_service_account(ctx))?,
        DesiredObject::from_resource(&generate_patroni_role(ctx))?,
        DesiredObject::from_resource(&generate_patroni_role_binding(ctx))?,
    ])
}

/// The instance StatefulSet
pub fn statefulset_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    Ok(vec![DesiredObject::from_resource(
        &generate_patroni_statefulset(ctx)?,
    )?])
}

fn metadata(ctx: &GenerationContext<'_>, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(ctx.namespace()),
        labels: Some(cluster_labels(ctx.cluster)),
        owner_references: Some(vec![owner_reference(ctx.cluster)]),
        ..Default::default()
    }
}

/// Generate a ServiceAccount for Patroni pods
pub fn generate_service_account(ctx: &GenerationContext<'_>) -> ServiceAccount {
    ServiceAccount {
        metadata: metadata(ctx, names::patroni_role(&ctx.name())),
        ..Default::default()
    }
}

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

/// Generate a Role granting Patroni access to its DCS objects
pub fn generate_patroni_role(ctx: &GenerationContext<'_>) -> Role {
    let all = [
        "get", "list", "watch", "create", "update", "patch", "delete",
    ];
    Role {
        metadata: metadata(ctx, names::patroni_role(&ctx.name())),
        rules: Some(vec![
            rule(&["endpoints", "configmaps"], &all),
            rule(&["endpoints/restricted"], &["create"]),
            rule(&["pods"], &["get", "list", "watch", "patch", "update"]),
            rule(&["services"], &["create"]),
        ]),
    }
}

/// Generate a RoleBinding for the Patroni ServiceAccount
pub fn generate_patroni_role_binding(ctx: &GenerationContext<'_>) -> RoleBinding {
    let name = names::patroni_role(&ctx.name());
    RoleBinding {
        metadata: metadata(ctx, name.clone()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: Some(ctx.namespace()),
            ..Default::default()
        }]),
    }
}

/// Generate pod anti-affinity for spreading instances across nodes and zones
fn generate_anti_affinity(cluster_name: &str) -> Affinity {
    let term = |weight: i32, topology_key: &str| WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: CLUSTER_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![cluster_name.to_string()]),
                }]),
                ..Default::default()
            }),
            topology_key: topology_key.to_string(),
            ..Default::default()
        },
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                term(100, "kubernetes.io/hostname"),
                term(50, "topology.kubernetes.io/zone"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Recovery variables consumed by the bootstrap scripts
///
/// The point-in-time target is rendered in the `YYYY-MM-DD HH:MM:SS.ffffff+HH:MM`
/// form PostgreSQL expects for `recovery_target_time`.
fn restore_env(cluster: &PostgresCluster) -> Result<Vec<EnvVar>> {
    let Some(restore) = &cluster.spec.restore else {
        return Ok(Vec::new());
    };

    let mut env = vec![value_env("RECOVERY_FROM_BACKUP", restore.from_backup.clone())];
    if let Some(point_in_time) = &restore.point_in_time {
        let target = DateTime::parse_from_rfc3339(point_in_time).map_err(|e| {
            Error::ValidationError(format!(
                "invalid restore.pointInTime '{}': {}",
                point_in_time, e
            ))
        })?;
        env.push(value_env(
            "RECOVERY_TARGET_TIME",
            target.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string(),
        ));
    }
    Ok(env)
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn http_probe(path: &str, period: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(PATRONI_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Generate the StatefulSet running one Patroni member per pod
///
/// Any pod can become the primary; Patroni moves the `role` label. The pod
/// template carries the configuration fingerprint so running instances can be
/// compared against the desired configuration.
pub fn generate_patroni_statefulset(ctx: &GenerationContext<'_>) -> Result<StatefulSet> {
    let cluster = ctx.cluster;
    let name = ctx.name();
    let template = instance_template(ctx)?;

    let mut env = vec![
        field_env("PATRONI_NAME", "metadata.name"),
        field_env("POD_IP", "status.podIP"),
        field_env("PATRONI_KUBERNETES_POD_IP", "status.podIP"),
        value_env(
            "PATRONI_POSTGRESQL_CONNECT_ADDRESS",
            format!("$(POD_IP):{}", POSTGRES_PORT),
        ),
        value_env(
            "PATRONI_RESTAPI_CONNECT_ADDRESS",
            format!("$(POD_IP):{}", PATRONI_PORT),
        ),
        value_env("PGDATA", PGDATA),
        secret_env(
            "PGPASSWORD_SUPERUSER",
            &format!("{}-credentials", name),
            "superuser-password",
        ),
        secret_env(
            "PGPASSWORD_STANDBY",
            &format!("{}-credentials", name),
            "replication-password",
        ),
    ];
    env.extend(restore_env(cluster)?);

    let mut env_from = vec![EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: names::patroni_config(&name),
            optional: Some(false),
        }),
        ..Default::default()
    }];
    if let Some(backup) = &cluster.spec.backup {
        env_from.push(EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: backup.credentials_secret.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        });
    }

    let container = Container {
        name: PATRONI_CONTAINER.to_string(),
        image: Some(template.image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![
            ContainerPort {
                container_port: POSTGRES_PORT,
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: PATRONI_PORT,
                name: Some("patroni".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(env),
        env_from: Some(env_from),
        volume_mounts: Some(vec![VolumeMount {
            name: "data".to_string(),
            mount_path: DATA_MOUNT.to_string(),
            ..Default::default()
        }]),
        resources: cluster.spec.resources.as_ref().map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(quantities),
            requests: r.requests.as_ref().map(quantities),
            ..Default::default()
        }),
        readiness_probe: Some(http_probe("/readiness", 10, 3)),
        liveness_probe: Some(http_probe("/liveness", 10, 6)),
        ..Default::default()
    };

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cluster.spec.storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cluster.spec.storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: metadata(ctx, names::patroni(&name)),
        spec: Some(StatefulSetSpec {
            service_name: Some(names::config_service(&name)),
            replicas: Some(cluster.spec.instances),
            selector: LabelSelector {
                match_labels: Some(patroni_labels(&name)),
                ..Default::default()
            },
            // Restarts are driven by PostgresDbOps, never by template changes
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(cluster_labels(cluster)),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        template.config_hash,
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(names::patroni_role(&name)),
                    containers: vec![container],
                    termination_grace_period_seconds: Some(30),
                    affinity: Some(generate_anti_affinity(&name)),
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(103),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Retain".to_string()),
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    })
}
