//! Kubernetes Event publishing
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconciliation or the restart that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::resources::common::FIELD_MANAGER;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const CLUSTER_CREATED: &str = "ClusterCreated";
    pub const CLUSTER_UPDATED: &str = "ClusterUpdated";
    /// Desired state could not be generated
    pub const CLUSTER_CONFIG_FAILED: &str = "ClusterConfigFailed";
    /// One object could not be written
    pub const APPLY_FAILED: &str = "ApplyFailed";

    pub const POD_CREATED: &str = "PodCreated";
    pub const POD_RESTART: &str = "PodRestart";
    pub const POSTGRES_RESTART: &str = "PostgresRestart";
    pub const SWITCHOVER: &str = "Switchover";
    pub const RESTART_COMPLETED: &str = "RestartCompleted";
    pub const RESTART_FAILED: &str = "RestartFailed";
}

pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const RESTART: &str = "Restart";
}
