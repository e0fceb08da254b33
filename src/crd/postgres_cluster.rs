use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.dev",
    version = "v1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.postgres.version"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of instances (Patroni members), one of which is the primary
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// PostgreSQL version and image
    pub postgres: PostgresSpec,

    /// Storage configuration for PostgreSQL data
    pub storage: StorageSpec,

    /// Resource requirements for PostgreSQL pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// References to PostgreSQL and Patroni configuration
    #[serde(default)]
    pub configuration: ClusterConfiguration,

    /// Exposure of the read-write and read-only endpoints
    #[serde(default)]
    pub postgres_services: PostgresServices,

    /// Continuous backup configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Bootstrap the cluster from an existing backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    /// User-defined labels applied to every generated object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_instances() -> i32 {
    1
}

/// PostgreSQL engine settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresSpec {
    /// Major version (e.g., "15", "16")
    pub version: String,

    /// Container image override; defaults to the Spilo image for `version`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// postgresql.conf parameters set inline
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Storage configuration for PostgreSQL data volumes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi", "100Gi")
    pub size: String,
}

/// Resource requirements for PostgreSQL pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    /// CPU quantity (e.g., "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g., "512Mi", "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Configuration references
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    /// Name of a ConfigMap in the cluster namespace whose data holds
    /// postgresql.conf parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_config: Option<String>,

    /// Patroni DCS settings
    #[serde(default)]
    pub patroni: PatroniSettings,
}

/// Patroni dynamic configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniSettings {
    #[serde(default = "default_ttl")]
    pub ttl: i32,

    #[serde(default = "default_loop_wait")]
    pub loop_wait: i32,

    #[serde(default = "default_retry_timeout")]
    pub retry_timeout: i32,

    /// Bytes a replica may lag and still be eligible for failover
    #[serde(default = "default_maximum_lag_on_failover")]
    pub maximum_lag_on_failover: i64,
}

impl Default for PatroniSettings {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            loop_wait: default_loop_wait(),
            retry_timeout: default_retry_timeout(),
            maximum_lag_on_failover: default_maximum_lag_on_failover(),
        }
    }
}

fn default_ttl() -> i32 {
    30
}

fn default_loop_wait() -> i32 {
    10
}

fn default_retry_timeout() -> i32 {
    10
}

fn default_maximum_lag_on_failover() -> i64 {
    33_554_432
}

/// Read-write and read-only service exposure
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresServices {
    #[serde(default)]
    pub primary: PostgresServiceSpec,

    #[serde(default)]
    pub replicas: PostgresServiceSpec,
}

/// Configuration of a single client-facing service
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresServiceSpec {
    /// Whether the service is generated at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, rename = "type")]
    pub type_: ServiceType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Default for PostgresServiceSpec {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            type_: ServiceType::default(),
            annotations: BTreeMap::new(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Kubernetes Service type
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

/// Continuous backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Base backup schedule in cron format
    pub schedule: String,

    /// Number of base backups to retain
    #[serde(default = "default_retention")]
    pub retention: i32,

    /// Secret holding object storage credentials and the bucket prefix
    pub credentials_secret: String,
}

fn default_retention() -> i32 {
    5
}

/// Restore from a backup at bootstrap
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the backup to restore
    pub from_backup: String,

    /// Point-in-time recovery target (RFC 3339 timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_in_time: Option<String>,
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Number of instances the generated StatefulSet declares
    #[serde(default)]
    pub instances: i32,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Restart in flight; absent once no restart is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<ClusterRestartStatus>,
}

/// Cluster-side projection of an in-flight restart
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRestartStatus {
    pub primary_instance: String,

    #[serde(default)]
    pub initial_instances: Vec<String>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Nothing applied yet
    #[default]
    Pending,
    /// Last reconciliation applied every object
    Reconciled,
    /// Last reconciliation left some objects unapplied
    Degraded,
    /// Desired state could not be generated
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Reconciled => write!(f, "Reconciled"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
            ClusterPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
