//! Restart plan: an immutable value rebuilt on every step
//!
//! `build_plan` either creates the plan from the live instances or, once the
//! operation status holds a plan, rebuilds the same plan from it. The second
//! path is what lets a restarted controller resume without restarting an
//! instance twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::controller::events::reasons;
use crate::controller::restart::instance::{
    Instance, RestartReason, RestartReasons, ordinal_of, restart_reasons,
};
use crate::controller::validation::MAX_INSTANCES;
use crate::crd::{
    ClusterRestartStatus, DbOpsRestartStatus, PostgresDbOps, RestartMethod, RestartPhase,
};
use crate::resources::common::names;
use crate::resources::patroni::InstanceTemplate;

/// One completed step of a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartEvent {
    /// The instance came up as a new pod
    PodCreated(String),
    /// The instance pod was deleted and recreated
    PodRestart(String),
    /// Only the PostgreSQL process of the instance was restarted
    PostgresRestart(String),
    /// Leadership moved from `primary` to `candidate`
    Switchover { primary: String, candidate: String },
}

impl RestartEvent {
    /// The instance the event is about; the former primary for a switchover
    pub fn instance(&self) -> &str {
        match self {
            RestartEvent::PodCreated(name)
            | RestartEvent::PodRestart(name)
            | RestartEvent::PostgresRestart(name) => name,
            RestartEvent::Switchover { primary, .. } => primary,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RestartEvent::PodCreated(_) => "POD_CREATED",
            RestartEvent::PodRestart(_) => "POD_RESTART",
            RestartEvent::PostgresRestart(_) => "POSTGRES_RESTART",
            RestartEvent::Switchover { .. } => "SWITCHOVER",
        }
    }

    /// Kubernetes Event reason
    pub fn reason(&self) -> &'static str {
        match self {
            RestartEvent::PodCreated(_) => reasons::POD_CREATED,
            RestartEvent::PodRestart(_) => reasons::POD_RESTART,
            RestartEvent::PostgresRestart(_) => reasons::POSTGRES_RESTART,
            RestartEvent::Switchover { .. } => reasons::SWITCHOVER,
        }
    }
}

impl fmt::Display for RestartEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartEvent::Switchover { primary, candidate } => {
                write!(f, "SWITCHOVER({} -> {})", primary, candidate)
            }
            other => write!(f, "{}({})", other.type_name(), other.instance()),
        }
    }
}

/// Sort instance names by ordinal, then by name
pub fn sort_by_ordinal(names: &mut [String]) {
    names.sort_by(|a, b| (ordinal_of(a), a).cmp(&(ordinal_of(b), b)));
}

/// The restart plan and its progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRestartState {
    pub namespace: String,
    pub dbops_name: String,
    pub cluster_name: String,
    pub method: RestartMethod,
    pub only_pending_restart: bool,
    pub primary_instance: String,
    /// Instances present when the plan was created, in ordinal order
    pub initial_instances: Vec<String>,
    /// Initial instances plus those that appeared during the run
    pub total_instances: Vec<String>,
    /// In the order they were restarted
    pub restarted_instances: Vec<String>,
    pub switchover_initiated: bool,
    pub restart_reasons: BTreeMap<String, RestartReasons>,
}

impl ClusterRestartState {
    /// The plan after `event`
    pub fn apply(&self, event: &RestartEvent) -> Self {
        let mut next = self.clone();
        match event {
            RestartEvent::PodCreated(name) => {
                if !next.total_instances.contains(name) {
                    next.total_instances.push(name.clone());
                    sort_by_ordinal(&mut next.total_instances);
                }
                next.mark_restarted(name);
            }
            RestartEvent::PodRestart(name) | RestartEvent::PostgresRestart(name) => {
                next.mark_restarted(name);
            }
            RestartEvent::Switchover { .. } => next.switchover_initiated = true,
        }
        next
    }

    fn mark_restarted(&mut self, name: &str) {
        if !self.is_restarted(name) {
            self.restarted_instances.push(name.to_string());
        }
    }

    pub fn is_restarted(&self, name: &str) -> bool {
        self.restarted_instances.iter().any(|n| n == name)
    }

    pub fn reasons(&self, name: &str) -> RestartReasons {
        self.restart_reasons.get(name).cloned().unwrap_or_default()
    }

    /// Instances that still need a restart, in ordinal order
    pub fn pending_to_restart(&self) -> Vec<String> {
        self.total_instances
            .iter()
            .filter(|name| !self.is_restarted(name) && !self.reasons(name).is_empty())
            .cloned()
            .collect()
    }

    /// Non-primary instances that still need a restart, in ordinal order
    pub fn pending_replicas(&self) -> Vec<String> {
        self.pending_to_restart()
            .into_iter()
            .filter(|name| *name != self.primary_instance)
            .collect()
    }

    pub fn primary_needs_restart(&self) -> bool {
        !self.is_restarted(&self.primary_instance)
            && !self.reasons(&self.primary_instance).is_empty()
    }

    /// Another instance exists that could take over leadership
    pub fn has_switchover_candidate(&self) -> bool {
        self.total_instances
            .iter()
            .any(|name| *name != self.primary_instance)
    }

    pub fn is_complete(&self) -> bool {
        self.pending_to_restart().is_empty()
    }

    /// Ordinal of the extra replica a reduced-impact restart runs with
    ///
    /// It follows the highest initial ordinal, so scaling the cluster back to
    /// this count removes exactly that pod.
    pub fn surge_ordinal(&self) -> Option<u32> {
        if self.method != RestartMethod::ReducedImpact || self.initial_instances.len() < 2 {
            return None;
        }
        let ordinal = self
            .initial_instances
            .iter()
            .filter_map(|name| ordinal_of(name))
            .max()?
            + 1;
        i32::try_from(ordinal)
            .is_ok_and(|o| o < MAX_INSTANCES)
            .then_some(ordinal)
    }

    pub fn surge_instance(&self) -> Option<String> {
        self.surge_ordinal()
            .map(|ordinal| names::instance(&self.cluster_name, ordinal))
    }

    /// The extra replica still has to be created before anything restarts
    pub fn needs_surge(&self) -> bool {
        self.surge_instance().is_some_and(|surge| {
            !self.is_restarted(&surge)
                && !self.switchover_initiated
                && !self.pending_to_restart().is_empty()
        })
    }

    /// Phase implied by the progress recorded so far
    pub fn phase(&self) -> RestartPhase {
        if self.is_restarted(&self.primary_instance) {
            RestartPhase::RestartingPrimary
        } else if self.switchover_initiated {
            RestartPhase::SwitchoverPending
        } else if !self.restarted_instances.is_empty() {
            RestartPhase::RestartingReplicas
        } else {
            RestartPhase::Initialized
        }
    }

    pub fn to_operation_status(&self, failure: Option<String>) -> DbOpsRestartStatus {
        DbOpsRestartStatus {
            primary_instance: self.primary_instance.clone(),
            initial_instances: self.initial_instances.clone(),
            pending_to_restart_instances: self.pending_to_restart(),
            restarted_instances: self.restarted_instances.clone(),
            switchover_initiated: self.switchover_initiated,
            failure,
        }
    }

    pub fn to_cluster_status(&self) -> ClusterRestartStatus {
        ClusterRestartStatus {
            primary_instance: self.primary_instance.clone(),
            initial_instances: self.initial_instances.clone(),
        }
    }
}

fn the_primary(cluster_name: &str, instances: &[Instance]) -> Result<String> {
    let primaries: Vec<_> = instances.iter().filter(|i| i.is_primary()).collect();
    match primaries.as_slice() {
        [primary] => Ok(primary.name.clone()),
        [] => Err(Error::InvalidClusterState(format!(
            "Cluster {} has no primary pod",
            cluster_name
        ))),
        many => Err(Error::InvalidClusterState(format!(
            "Cluster {} has {} primary pods",
            cluster_name,
            many.len()
        ))),
    }
}

/// Build the restart plan for an operation
///
/// Reasons are evaluated against the live instances. A planned instance whose
/// pod is currently missing can only be judged by the operation itself.
pub fn build_plan(
    dbops: &PostgresDbOps,
    instances: &[Instance],
    template: &InstanceTemplate,
) -> Result<ClusterRestartState> {
    let cluster_name = dbops.spec.cluster.clone();
    let only_pending_restart = dbops.spec.restart.only_pending_restart;

    let mut restart_reasons_map: BTreeMap<String, RestartReasons> = instances
        .iter()
        .map(|i| {
            (
                i.name.clone(),
                restart_reasons(i, template, only_pending_restart),
            )
        })
        .collect();

    // A failure recorded before any plan existed carries no instances
    let persisted = dbops
        .status
        .as_ref()
        .and_then(|s| s.restart.as_ref())
        .filter(|r| !r.initial_instances.is_empty());

    let (primary_instance, initial_instances, total_instances, restarted_instances, switchover) =
        match persisted {
            Some(progress) => {
                let mut total: BTreeSet<String> = progress.initial_instances.iter().cloned().collect();
                total.extend(progress.pending_to_restart_instances.iter().cloned());
                total.extend(progress.restarted_instances.iter().cloned());
                let mut total: Vec<String> = total.into_iter().collect();
                sort_by_ordinal(&mut total);

                (
                    progress.primary_instance.clone(),
                    progress.initial_instances.clone(),
                    total,
                    progress.restarted_instances.clone(),
                    progress.switchover_initiated,
                )
            }
            None => {
                let primary = the_primary(&cluster_name, instances)?;
                let mut initial: Vec<String> = instances.iter().map(|i| i.name.clone()).collect();
                sort_by_ordinal(&mut initial);
                (primary, initial.clone(), initial, Vec::new(), false)
            }
        };

    for name in &total_instances {
        restart_reasons_map.entry(name.clone()).or_insert_with(|| {
            if only_pending_restart {
                RestartReasons::new()
            } else {
                RestartReasons::from([RestartReason::OperationRequested])
            }
        });
    }
    // Instances that appeared after planning are adopted, not restarted
    restart_reasons_map.retain(|name, _| total_instances.contains(name));

    Ok(ClusterRestartState {
        namespace: dbops.namespace().unwrap_or_default(),
        dbops_name: dbops.name_any(),
        cluster_name,
        method: dbops.spec.restart.method,
        only_pending_restart,
        primary_instance,
        initial_instances,
        total_instances,
        restarted_instances,
        switchover_initiated: switchover,
        restart_reasons: restart_reasons_map,
    })
}
