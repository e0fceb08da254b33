//! Sequential execution of a restart plan
//!
//! The orchestrator is a stream of `RestartEvent`s. Each item performs one
//! step against the live instances and yields the event describing it; the
//! next step is only chosen after the previous one finished, so ordering
//! follows from the plan alone.

use async_trait::async_trait;
use futures::Stream;
use futures::stream::try_unfold;
use kube::ResourceExt;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::controller::restart::instance::{Instance, InstanceRole, needs_only_postgres_restart};
use crate::controller::restart::plan::{ClusterRestartState, RestartEvent};
use crate::controller::status::StatusStore;
use crate::crd::RestartMethod;
use crate::resources::common::names;

/// Actions on database instances
///
/// Every method returns once the instance is ready again, or fails with
/// `ReadinessTimeout`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceOps: Send + Sync {
    async fn list_instances(&self, namespace: &str, cluster: &str) -> Result<Vec<Instance>>;

    /// Delete the pod and wait for its replacement
    async fn restart_pod(&self, namespace: &str, instance: &str) -> Result<()>;

    /// Wait for a pod that is being created
    async fn wait_ready(&self, namespace: &str, instance: &str) -> Result<()>;

    /// Restart PostgreSQL inside the running pod
    async fn restart_postgres(&self, namespace: &str, instance: &str) -> Result<()>;

    /// Move leadership from `primary` to `candidate`
    async fn switchover(
        &self,
        namespace: &str,
        cluster: &str,
        primary: &str,
        candidate: &str,
    ) -> Result<()>;

    /// Set the instance count of the cluster; returns without waiting for pods
    async fn scale_instances(&self, namespace: &str, cluster: &str, instances: i32) -> Result<()>;
}

/// The next thing to do for a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartStep {
    /// A pod outside the plan appeared; wait for it and add it
    Adopt(String),
    /// Add one replica for the duration of the restart
    Surge { name: String, instances: i32 },
    /// A planned pod is missing; wait for the StatefulSet to recreate it
    WaitCreated(String),
    Restart { name: String, postgres_only: bool },
    /// `already_done` when leadership moved away from the planned primary on its own
    Switchover {
        primary: String,
        candidate: String,
        already_done: bool,
    },
}

/// Pick the replica that takes over from the planned primary
///
/// Restarted replicas are preferred so the new primary already runs the new
/// configuration. The surge replica never leads; it goes away with the restart.
pub fn choose_candidate<'i>(
    state: &ClusterRestartState,
    instances: &'i [Instance],
) -> Option<&'i Instance> {
    let surge = state.surge_instance();
    instances
        .iter()
        .filter(|i| i.role == InstanceRole::Replica && i.ready && i.name != state.primary_instance)
        .filter(|i| surge.as_deref() != Some(i.name.as_str()))
        .min_by_key(|i| (!state.is_restarted(&i.name), i.ordinal))
}

fn restart_step(state: &ClusterRestartState, instances: &[Instance], name: &str) -> RestartStep {
    if !instances.iter().any(|i| i.name == name) {
        return RestartStep::WaitCreated(name.to_string());
    }
    let postgres_only = state.method == RestartMethod::ReducedImpact
        && needs_only_postgres_restart(&state.reasons(name));
    RestartStep::Restart {
        name: name.to_string(),
        postgres_only,
    }
}

/// Decide the next step, or `None` when the plan is done
///
/// Order: adopt new pods, add the surge replica, restart replicas by
/// ordinal, switch over, restart the former primary.
pub fn next_step(
    state: &ClusterRestartState,
    instances: &[Instance],
) -> Result<Option<RestartStep>> {
    let mut live: Vec<&Instance> = instances.iter().collect();
    live.sort_by_key(|i| (i.ordinal, i.name.clone()));

    if let Some(new) = live
        .iter()
        .find(|i| !state.total_instances.contains(&i.name))
    {
        return Ok(Some(RestartStep::Adopt(new.name.clone())));
    }

    if let Some(ordinal) = state.surge_ordinal().filter(|_| state.needs_surge()) {
        return Ok(Some(RestartStep::Surge {
            name: names::instance(&state.cluster_name, ordinal),
            instances: ordinal as i32 + 1,
        }));
    }

    if let Some(replica) = state.pending_replicas().first() {
        return Ok(Some(restart_step(state, instances, replica)));
    }

    if !state.primary_needs_restart() {
        return Ok(None);
    }

    if state.has_switchover_candidate() && !state.switchover_initiated {
        let primary = state.primary_instance.clone();
        let current = live.iter().find(|i| i.is_primary());
        if let Some(current) = current.filter(|c| c.name != primary) {
            return Ok(Some(RestartStep::Switchover {
                primary,
                candidate: current.name.clone(),
                already_done: true,
            }));
        }
        let candidate = choose_candidate(state, instances).ok_or_else(|| {
            Error::SwitchoverRejected(format!("no ready replica can take over from {}", primary))
        })?;
        return Ok(Some(RestartStep::Switchover {
            candidate: candidate.name.clone(),
            primary,
            already_done: false,
        }));
    }

    Ok(Some(restart_step(
        state,
        instances,
        &state.primary_instance,
    )))
}

#[derive(Clone, Copy)]
pub struct RestartOrchestrator<'a> {
    ops: &'a dyn InstanceOps,
    store: &'a dyn StatusStore,
}

impl<'a> RestartOrchestrator<'a> {
    pub fn new(ops: &'a dyn InstanceOps, store: &'a dyn StatusStore) -> Self {
        Self { ops, store }
    }

    /// Stop when the operation was deleted or is being deleted
    async fn ensure_active(&self, state: &ClusterRestartState) -> Result<()> {
        let op = self
            .store
            .get_operation(&state.namespace, &state.dbops_name)
            .await?;
        match op {
            Some(op) if op.metadata.deletion_timestamp.is_none() => Ok(()),
            Some(op) => Err(Error::Cancelled(format!(
                "PostgresDbOps {} is being deleted",
                op.name_any()
            ))),
            None => Err(Error::Cancelled(format!(
                "PostgresDbOps {} no longer exists",
                state.dbops_name
            ))),
        }
    }

    async fn execute(&self, state: &ClusterRestartState, step: RestartStep) -> Result<RestartEvent> {
        let namespace = state.namespace.as_str();
        match step {
            RestartStep::Adopt(name) | RestartStep::WaitCreated(name) => {
                self.ops.wait_ready(namespace, &name).await?;
                Ok(RestartEvent::PodCreated(name))
            }
            RestartStep::Surge { name, instances } => {
                info!(cluster = %state.cluster_name, instances, "Adding a replica for the restart");
                self.ops
                    .scale_instances(namespace, &state.cluster_name, instances)
                    .await?;
                self.ops.wait_ready(namespace, &name).await?;
                Ok(RestartEvent::PodCreated(name))
            }
            RestartStep::Restart {
                name,
                postgres_only: true,
            } => {
                self.ops.restart_postgres(namespace, &name).await?;
                Ok(RestartEvent::PostgresRestart(name))
            }
            RestartStep::Restart { name, .. } => {
                self.ops.restart_pod(namespace, &name).await?;
                Ok(RestartEvent::PodRestart(name))
            }
            RestartStep::Switchover {
                primary,
                candidate,
                already_done,
            } => {
                if already_done {
                    info!(%primary, %candidate, "Leadership already moved, skipping switchover");
                } else {
                    self.ops
                        .switchover(namespace, &state.cluster_name, &primary, &candidate)
                        .await?;
                }
                Ok(RestartEvent::Switchover { primary, candidate })
            }
        }
    }

    /// Perform the next step of `state`
    pub async fn next_event(&self, state: &ClusterRestartState) -> Result<Option<RestartEvent>> {
        self.ensure_active(state).await?;

        let instances = self
            .ops
            .list_instances(&state.namespace, &state.cluster_name)
            .await?;
        let Some(step) = next_step(state, &instances)? else {
            return Ok(None);
        };

        debug!(cluster = %state.cluster_name, ?step, "Executing restart step");
        self.execute(state, step).await.map(Some)
    }

    /// Remove the surge replica of a finished plan
    ///
    /// Safe to repeat: the cluster is set to the same count every time.
    pub async fn scale_back(&self, state: &ClusterRestartState) -> Result<()> {
        let Some(ordinal) = state
            .surge_ordinal()
            .filter(|_| state.surge_instance().is_some_and(|s| state.is_restarted(&s)))
        else {
            return Ok(());
        };
        info!(cluster = %state.cluster_name, instances = ordinal, "Removing the restart replica");
        self.ops
            .scale_instances(&state.namespace, &state.cluster_name, ordinal as i32)
            .await
    }

    /// Events of the remaining run, in order
    ///
    /// The stream ends after the last step and stops at the first error.
    pub fn events(
        self,
        state: ClusterRestartState,
    ) -> impl Stream<Item = Result<RestartEvent>> + Send + 'a {
        try_unfold(state, move |state| async move {
            let step = self.next_event(&state).await?.map(|event| {
                let next = state.apply(&event);
                (event, next)
            });
            Ok::<_, Error>(step)
        })
    }
}
