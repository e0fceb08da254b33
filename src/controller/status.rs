//! Status and conditions management
//!
//! Status writes are merge patches carrying the resource version that was read,
//! so a concurrent writer makes the patch fail with a conflict. `StatusManager`
//! re-reads and retries such a write a bounded number of times.

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{Value, json};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::crd::{Condition, PostgresCluster, PostgresClusterStatus, PostgresDbOps, PostgresDbOpsStatus};
use crate::resources::common::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Cluster is ready to accept connections
    pub const READY: &str = "Ready";
    /// Cluster is progressing towards a goal state
    pub const PROGRESSING: &str = "Progressing";
    /// Cluster is in a degraded state but still functional
    pub const DEGRADED: &str = "Degraded";
    /// Desired state could be generated from the spec
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    /// The operation finished successfully
    pub const COMPLETED: &str = "Completed";
    /// The operation stopped on an unrecoverable error
    pub const FAILED: &str = "Failed";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

fn bool_status(value: bool) -> &'static str {
    if value {
        condition_status::TRUE
    } else {
        condition_status::FALSE
    }
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        let now = Utc::now().to_rfc3339();

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = now;
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            });
        }
        self
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::READY, bool_status(is_ready), reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::PROGRESSING,
            bool_status(is_progressing),
            reason,
            message,
        )
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::DEGRADED,
            bool_status(is_degraded),
            reason,
            message,
        )
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::CONFIG_VALID,
            bool_status(is_valid),
            reason,
            message,
        )
    }

    pub fn completed(self, is_completed: bool, reason: &str, message: &str) -> Self {
        self.set_condition(
            condition_types::COMPLETED,
            bool_status(is_completed),
            reason,
            message,
        )
    }

    pub fn failed(self, is_failed: bool, reason: &str, message: &str) -> Self {
        self.set_condition(condition_types::FAILED, bool_status(is_failed), reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Read/modify/write access to the status subresources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_operation(&self, namespace: &str, name: &str) -> Result<Option<PostgresDbOps>>;

    /// Merge `status` into the operation status if its resource version still matches
    async fn patch_operation_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: Value,
    ) -> Result<()>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PostgresCluster>>;

    /// Merge `status` into the cluster status if its resource version still matches
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: Value,
    ) -> Result<()>;
}

/// `StatusStore` backed by the Kubernetes API server
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn status_patch(resource_version: Option<String>, status: Value) -> Value {
    match resource_version {
        Some(version) => json!({"metadata": {"resourceVersion": version}, "status": status}),
        None => json!({ "status": status }),
    }
}

fn status_error(kind: &str, namespace: &str, name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(ref response) if response.code == 409 => {
            Error::StatusConflict(format!("{} {}/{}", kind, namespace, name))
        }
        kube::Error::Api(ref response) if response.code == 404 => {
            Error::NotFound(format!("{} {}/{}", kind, namespace, name))
        }
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get_operation(&self, namespace: &str, name: &str) -> Result<Option<PostgresDbOps>> {
        let api: Api<PostgresDbOps> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_operation_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: Value,
    ) -> Result<()> {
        let api: Api<PostgresDbOps> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch(resource_version, status)),
        )
        .await
        .map_err(|e| status_error("PostgresDbOps", namespace, name, e))?;
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PostgresCluster>> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: Value,
    ) -> Result<()> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch(resource_version, status)),
        )
        .await
        .map_err(|e| status_error("PostgresCluster", namespace, name, e))?;
        Ok(())
    }
}

/// Serialize a cluster status so that a cleared restart is removed by the merge
fn cluster_status_value(status: &PostgresClusterStatus) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(map) = value.as_object_mut() {
        map.entry("restart").or_insert(Value::Null);
    }
    Ok(value)
}

/// Optimistic-concurrency status updates for one namespace
pub struct StatusManager<'a> {
    store: &'a dyn StatusStore,
    namespace: &'a str,
    retries: u32,
}

impl<'a> StatusManager<'a> {
    pub fn new(store: &'a dyn StatusStore, namespace: &'a str, retries: u32) -> Self {
        Self {
            store,
            namespace,
            retries: retries.max(1),
        }
    }

    /// Re-read the operation, apply `update` to its status and write it back
    ///
    /// Returns the status that was written.
    pub async fn update_operation<F>(&self, name: &str, update: F) -> Result<PostgresDbOpsStatus>
    where
        F: Fn(PostgresDbOpsStatus) -> PostgresDbOpsStatus + Send + Sync,
    {
        let mut last_error = None;
        for attempt in 0..self.retries {
            let op = self
                .store
                .get_operation(self.namespace, name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("PostgresDbOps {}/{}", self.namespace, name)))?;

            let status = update(op.status.clone().unwrap_or_default());
            match self
                .store
                .patch_operation_status(
                    self.namespace,
                    name,
                    op.metadata.resource_version.clone(),
                    serde_json::to_value(&status)?,
                )
                .await
            {
                Ok(()) => return Ok(status),
                Err(e) if e.is_conflict() => {
                    debug!(name, attempt, "Operation status conflict, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::StatusConflict(format!("PostgresDbOps {}/{}", self.namespace, name))))
    }

    /// Re-read the cluster, apply `update` to its status and write it back
    pub async fn update_cluster<F>(&self, name: &str, update: F) -> Result<PostgresClusterStatus>
    where
        F: Fn(&PostgresCluster, PostgresClusterStatus) -> PostgresClusterStatus + Send + Sync,
    {
        let mut last_error = None;
        for attempt in 0..self.retries {
            let cluster = self
                .store
                .get_cluster(self.namespace, name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("PostgresCluster {}/{}", self.namespace, name)))?;

            let status = update(&cluster, cluster.status.clone().unwrap_or_default());
            match self
                .store
                .patch_cluster_status(
                    self.namespace,
                    name,
                    cluster.metadata.resource_version.clone(),
                    cluster_status_value(&status)?,
                )
                .await
            {
                Ok(()) => return Ok(status),
                Err(e) if e.is_conflict() => {
                    debug!(name, attempt, "Cluster status conflict, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::StatusConflict(format!("PostgresCluster {}/{}", self.namespace, name))))
    }
}
