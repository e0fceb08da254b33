//! Instance facts and restart reasons

use std::collections::BTreeSet;
use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::resources::common::{
    CONFIG_HASH_ANNOTATION, PATRONI_CONTAINER, PRIMARY_ROLE, REPLICA_ROLE, ROLE_LABEL,
};
use crate::resources::patroni::InstanceTemplate;

/// Annotation Patroni writes on its own pod with the member state
pub const PATRONI_STATUS_ANNOTATION: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceRole {
    Primary,
    Replica,
    /// Patroni has not labelled the pod yet
    Unknown,
}

impl InstanceRole {
    fn from_label(label: Option<&str>) -> Self {
        match label {
            Some(PRIMARY_ROLE) => InstanceRole::Primary,
            Some(REPLICA_ROLE) => InstanceRole::Replica,
            _ => InstanceRole::Unknown,
        }
    }
}

/// One database instance, as observed through its pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub ordinal: u32,
    pub role: InstanceRole,
    pub ready: bool,
    pub config_hash: Option<String>,
    pub image: Option<String>,
    pub pending_restart: bool,
}

/// The subset of Patroni's member state the operator reads
#[derive(Debug, Default, Deserialize)]
struct PatroniMemberState {
    #[serde(default)]
    pending_restart: bool,
}

/// Ordinal suffix of a StatefulSet pod name
pub fn ordinal_of(name: &str) -> Option<u32> {
    name.rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
}

impl Instance {
    /// Read instance facts from a pod; pods without an ordinal are skipped
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.name_any();
        let ordinal = ordinal_of(&name)?;
        let annotations = pod.annotations();

        let pending_restart = annotations
            .get(PATRONI_STATUS_ANNOTATION)
            .and_then(|raw| serde_json::from_str::<PatroniMemberState>(raw).ok())
            .unwrap_or_default()
            .pending_restart;

        let image = pod.spec.as_ref().and_then(|spec| {
            spec.containers
                .iter()
                .find(|c| c.name == PATRONI_CONTAINER)
                .and_then(|c| c.image.clone())
        });

        Some(Self {
            ordinal,
            role: InstanceRole::from_label(pod.labels().get(ROLE_LABEL).map(String::as_str)),
            ready: is_pod_ready(pod),
            config_hash: annotations.get(CONFIG_HASH_ANNOTATION).cloned(),
            image,
            pending_restart,
            name,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.role == InstanceRole::Primary
    }
}

/// Why an instance must be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RestartReason {
    /// Patroni reports parameters that only take effect after a restart
    PatroniRestartPending,
    /// The pod runs an older Patroni configuration
    ConfigChanged,
    /// The pod runs a different image
    ImageChanged,
    /// The operation restarts every instance
    OperationRequested,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::PatroniRestartPending => write!(f, "PatroniRestartPending"),
            RestartReason::ConfigChanged => write!(f, "ConfigChanged"),
            RestartReason::ImageChanged => write!(f, "ImageChanged"),
            RestartReason::OperationRequested => write!(f, "OperationRequested"),
        }
    }
}

pub type RestartReasons = BTreeSet<RestartReason>;

/// Compare an instance with the desired template
///
/// An instance that has not reported a fingerprint or image yet is not
/// counted as changed.
pub fn restart_reasons(
    instance: &Instance,
    template: &InstanceTemplate,
    only_pending_restart: bool,
) -> RestartReasons {
    let mut reasons = RestartReasons::new();
    if instance.pending_restart {
        reasons.insert(RestartReason::PatroniRestartPending);
    }
    if instance
        .config_hash
        .as_ref()
        .is_some_and(|hash| *hash != template.config_hash)
    {
        reasons.insert(RestartReason::ConfigChanged);
    }
    if instance
        .image
        .as_ref()
        .is_some_and(|image| *image != template.image)
    {
        reasons.insert(RestartReason::ImageChanged);
    }
    if !only_pending_restart {
        reasons.insert(RestartReason::OperationRequested);
    }
    reasons
}

/// Only Patroni's pending flag is set, so restarting PostgreSQL is enough
pub fn needs_only_postgres_restart(reasons: &RestartReasons) -> bool {
    reasons.len() == 1 && reasons.contains(&RestartReason::PatroniRestartPending)
}
