use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// PostgresDbOps requests a day-two operation on a PostgresCluster
///
/// Restart and security-upgrade operations both run the rolling restart:
/// replicas first, then a switchover, then the former primary.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.dev",
    version = "v1",
    kind = "PostgresDbOps",
    plural = "postgresdbops",
    shortname = "pgdbops",
    namespaced,
    status = "PostgresDbOpsStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Operation", "type":"string", "jsonPath":".spec.op"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Retries", "type":"integer", "jsonPath":".status.opRetries"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDbOpsSpec {
    /// Name of the target PostgresCluster in the same namespace
    pub cluster: String,

    /// Operation to run
    pub op: DbOpsOperation,

    /// Restart options
    #[serde(default)]
    pub restart: RestartOptions,

    /// How many times a failed operation is retried from its persisted progress
    #[serde(default)]
    pub max_retries: i32,
}

/// Supported operations
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DbOpsOperation {
    Restart,
    SecurityUpgrade,
}

impl std::fmt::Display for DbOpsOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbOpsOperation::Restart => write!(f, "restart"),
            DbOpsOperation::SecurityUpgrade => write!(f, "securityUpgrade"),
        }
    }
}

/// Restart options
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestartOptions {
    #[serde(default)]
    pub method: RestartMethod,

    /// Restart only instances that report a reason to restart
    #[serde(default)]
    pub only_pending_restart: bool,
}

/// How instances are restarted
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RestartMethod {
    /// Restart only the PostgreSQL process when that is sufficient
    #[default]
    ReducedImpact,
    /// Always recreate the pod
    Full,
}

impl std::fmt::Display for RestartMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartMethod::ReducedImpact => write!(f, "reducedImpact"),
            RestartMethod::Full => write!(f, "full"),
        }
    }
}

/// Status of a PostgresDbOps
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresDbOpsStatus {
    /// When the operation first started (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_started: Option<String>,

    /// Number of retries performed after failures
    #[serde(default)]
    pub op_retries: i32,

    #[serde(default)]
    pub phase: RestartPhase,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Restart progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<DbOpsRestartStatus>,
}

/// Persisted restart progress
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbOpsRestartStatus {
    pub primary_instance: String,

    #[serde(default)]
    pub initial_instances: Vec<String>,

    #[serde(default)]
    pub pending_to_restart_instances: Vec<String>,

    #[serde(default)]
    pub restarted_instances: Vec<String>,

    #[serde(default)]
    pub switchover_initiated: bool,

    /// Human-readable failure cause, cleared on retry
    #[serde(default)]
    pub failure: Option<String>,
}

/// Rolling restart phases
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum RestartPhase {
    #[default]
    NotStarted,
    Initialized,
    RestartingReplicas,
    SwitchoverPending,
    RestartingPrimary,
    Completed,
    Failed,
}

impl RestartPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestartPhase::Completed | RestartPhase::Failed)
    }
}

impl std::fmt::Display for RestartPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPhase::NotStarted => write!(f, "NotStarted"),
            RestartPhase::Initialized => write!(f, "Initialized"),
            RestartPhase::RestartingReplicas => write!(f, "RestartingReplicas"),
            RestartPhase::SwitchoverPending => write!(f, "SwitchoverPending"),
            RestartPhase::RestartingPrimary => write!(f, "RestartingPrimary"),
            RestartPhase::Completed => write!(f, "Completed"),
            RestartPhase::Failed => write!(f, "Failed"),
        }
    }
}
