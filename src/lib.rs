pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, Result, dbops_error_policy, error_policy, reconcile,
    reconcile_dbops,
};
pub use crd::{PostgresCluster, PostgresDbOps};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn log_result<K: Resource>(
    kind: &str,
    result: std::result::Result<(ObjectRef<K>, Action), ControllerError<Error, watcher::Error>>,
) {
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            // Watch events for related objects can still arrive after deletion
            let is_not_found = matches!(
                &e,
                ControllerError::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run the PostgresCluster controller
///
/// Watches clusters and every kind of object they own, so drift on an owned
/// object triggers a pass of its cluster. Watches only `namespace` when set.
pub async fn run_cluster_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PostgresCluster resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns(
            scoped_api::<ConfigMap>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Service>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Endpoints>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<StatefulSet>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<ServiceAccount>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<Role>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<RoleBinding>(client.clone(), namespace),
            watcher_config.clone(),
        )
        .owns(
            scoped_api::<PodDisruptionBudget>(client, namespace),
            watcher_config,
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_result("PostgresCluster", result) })
        .await;

    tracing::error!("Cluster controller stream ended unexpectedly");
}

/// Run the PostgresDbOps controller
pub async fn run_dbops_controller_scoped(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) {
    tracing::info!(
        "Starting controller for PostgresDbOps resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    let operations: Api<PostgresDbOps> = scoped_api(client, namespace);

    Controller::new(operations, WatcherConfig::default().any_semantic())
        .run(reconcile_dbops, dbops_error_policy, ctx)
        .for_each(|result| async move { log_result("PostgresDbOps", result) })
        .await;

    tracing::error!("Operation controller stream ended unexpectedly");
}
