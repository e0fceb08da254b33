//! Runs one restart operation end to end
//!
//! The handler owns every status write of a restart: the plan is persisted
//! once, each event updates the operation status, and completion clears the
//! cluster's transient restart status. Phase changes are checked against the
//! restart state machine before they are written.

use std::pin::pin;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::events::{EventPublisher, actions, reasons};
use crate::controller::restart::orchestrator::{InstanceOps, RestartOrchestrator};
use crate::controller::restart::plan::{ClusterRestartState, RestartEvent, build_plan};
use crate::controller::restart::state_machine::{
    RestartPhaseEvent, RestartStateMachine, TransitionContext, TransitionResult, event_for,
};
use crate::controller::status::{ConditionBuilder, StatusManager, StatusStore};
use crate::crd::{PostgresDbOps, RestartPhase};
use crate::health::Metrics;
use crate::resources::patroni::InstanceTemplate;

pub struct RestartHandler<'a> {
    ops: &'a dyn InstanceOps,
    store: &'a dyn StatusStore,
    events: &'a dyn EventPublisher,
    metrics: Option<&'a Metrics>,
    status_retries: u32,
    state_machine: RestartStateMachine,
}

impl<'a> RestartHandler<'a> {
    pub fn new(
        ops: &'a dyn InstanceOps,
        store: &'a dyn StatusStore,
        events: &'a dyn EventPublisher,
        status_retries: u32,
    ) -> Self {
        Self {
            ops,
            store,
            events,
            metrics: None,
            status_retries,
            state_machine: RestartStateMachine::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: &'a Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn transition(
        &self,
        from: RestartPhase,
        event: RestartPhaseEvent,
        ctx: &TransitionContext,
    ) -> Result<RestartPhase> {
        match self.state_machine.transition(&from, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                debug!(%from, %to, %event, description, "Restart phase transition");
                Ok(to)
            }
            TransitionResult::InvalidTransition { current, event } => Err(
                Error::InvalidTransition(format!("{} is not valid in phase {}", event, current)),
            ),
            TransitionResult::GuardFailed {
                from,
                to,
                event,
                reason,
            } => Err(Error::InvalidTransition(format!(
                "{} from {} to {} blocked: {}",
                event, from, to, reason
            ))),
        }
    }

    /// Restart the operation's cluster, resuming from any persisted progress
    ///
    /// Retryable errors are returned without touching the status so the next
    /// pass resumes from the last persisted step. Other errors mark the
    /// operation `Failed`. A cancelled run writes nothing.
    pub async fn restart_cluster(
        &self,
        dbops: &PostgresDbOps,
        template: &InstanceTemplate,
    ) -> Result<ClusterRestartState> {
        let namespace = dbops
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let status = StatusManager::new(self.store, &namespace, self.status_retries);
        let object_ref = dbops.object_ref(&());

        match self.run(dbops, template, &status, &object_ref).await {
            Ok(state) => Ok(state),
            Err(Error::Cancelled(message)) => {
                info!(name = %dbops.name_any(), %message, "Restart cancelled");
                Err(Error::Cancelled(message))
            }
            Err(e) if e.is_retryable() => {
                warn!(name = %dbops.name_any(), error = %e, "Restart interrupted, will resume");
                Err(e)
            }
            Err(e) => {
                self.record_failure(dbops, &status, &object_ref, &e).await?;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        dbops: &PostgresDbOps,
        template: &InstanceTemplate,
        status: &StatusManager<'_>,
        object_ref: &ObjectReference,
    ) -> Result<ClusterRestartState> {
        let name = dbops.name_any();
        let namespace = dbops.namespace().unwrap_or_default();

        let instances = self
            .ops
            .list_instances(&namespace, &dbops.spec.cluster)
            .await?;
        let mut state = build_plan(dbops, &instances, template)?;

        let persisted = dbops
            .status
            .as_ref()
            .and_then(|s| s.restart.as_ref())
            .is_some_and(|r| !r.initial_instances.is_empty());

        let mut phase = if persisted {
            info!(name = %name, restarted = ?state.restarted_instances, "Resuming restart");
            state.phase()
        } else {
            self.initialize(dbops, &state, status).await?
        };

        let orchestrator = RestartOrchestrator::new(self.ops, self.store);
        let mut events = pin!(orchestrator.events(state.clone()));

        while let Some(event) = events.next().await {
            let event = event?;
            let ctx = TransitionContext::for_plan(&state);
            let to = self.transition(phase, event_for(&state, &event), &ctx)?;
            let next = state.apply(&event);

            status
                .update_operation(&name, |mut s| {
                    s.phase = to;
                    s.restart = Some(next.to_operation_status(None));
                    s
                })
                .await?;

            info!(name = %name, %event, phase = %to, "Restart step completed");
            self.publish_step(object_ref, &event).await;

            state = next;
            phase = to;
        }

        match orchestrator.scale_back(&state).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(cluster = %state.cluster_name, "Cluster gone, nothing to scale back");
            }
            Err(e) => return Err(e),
        }

        self.complete(dbops, &state, phase, status, object_ref)
            .await?;
        Ok(state)
    }

    /// Persist a new plan to the operation and the cluster
    async fn initialize(
        &self,
        dbops: &PostgresDbOps,
        state: &ClusterRestartState,
        status: &StatusManager<'_>,
    ) -> Result<RestartPhase> {
        let ctx = TransitionContext::for_plan(state);
        let phase = self.transition(
            RestartPhase::NotStarted,
            RestartPhaseEvent::PlanInitialized,
            &ctx,
        )?;
        let generation = dbops.metadata.generation;
        let message = format!(
            "Restarting {} of {} instances",
            state.pending_to_restart().len(),
            state.total_instances.len()
        );

        status
            .update_operation(&dbops.name_any(), |mut s| {
                s.phase = phase;
                s.restart = Some(state.to_operation_status(None));
                s.conditions = ConditionBuilder::from_existing(s.conditions, generation)
                    .progressing(true, "RestartInitialized", &message)
                    .failed(false, "RestartInitialized", "")
                    .build();
                s
            })
            .await?;

        status
            .update_cluster(&state.cluster_name, |_, mut s| {
                s.restart = Some(state.to_cluster_status());
                s
            })
            .await?;

        info!(
            name = %dbops.name_any(),
            primary = %state.primary_instance,
            instances = ?state.initial_instances,
            "Restart plan initialized"
        );
        Ok(phase)
    }

    async fn complete(
        &self,
        dbops: &PostgresDbOps,
        state: &ClusterRestartState,
        phase: RestartPhase,
        status: &StatusManager<'_>,
        object_ref: &ObjectReference,
    ) -> Result<()> {
        let ctx = TransitionContext::for_plan(state);
        let to = self.transition(phase, RestartPhaseEvent::AllRestarted, &ctx)?;

        match status
            .update_cluster(&state.cluster_name, |_, mut s| {
                s.restart = None;
                s
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(cluster = %state.cluster_name, "Cluster gone, nothing to clear");
            }
            Err(e) => return Err(e),
        }

        let generation = dbops.metadata.generation;
        let message = format!("Restarted {} instances", state.restarted_instances.len());
        status
            .update_operation(&dbops.name_any(), |mut s| {
                s.phase = to;
                s.restart = Some(state.to_operation_status(None));
                s.conditions = ConditionBuilder::from_existing(s.conditions, generation)
                    .progressing(false, "RestartCompleted", &message)
                    .completed(true, "RestartCompleted", &message)
                    .failed(false, "RestartCompleted", "")
                    .build();
                s
            })
            .await?;

        info!(name = %dbops.name_any(), restarted = ?state.restarted_instances, "Restart completed");
        self.events
            .publish(
                object_ref,
                EventType::Normal,
                reasons::RESTART_COMPLETED,
                actions::RESTART,
                Some(message),
            )
            .await;
        Ok(())
    }

    async fn publish_step(&self, object_ref: &ObjectReference, event: &RestartEvent) {
        if let Some(metrics) = self.metrics {
            metrics.record_restart_event(event.type_name());
        }
        self.events
            .publish(
                object_ref,
                EventType::Normal,
                event.reason(),
                actions::RESTART,
                Some(event.to_string()),
            )
            .await;
    }

    /// Mark the operation `Failed`, keeping the progress made so far
    async fn record_failure(
        &self,
        dbops: &PostgresDbOps,
        status: &StatusManager<'_>,
        object_ref: &ObjectReference,
        cause: &Error,
    ) -> Result<()> {
        let message = cause.to_string();
        let generation = dbops.metadata.generation;
        let state_machine = &self.state_machine;
        error!(name = %dbops.name_any(), error = %message, "Restart failed");

        status
            .update_operation(&dbops.name_any(), |mut s| {
                if state_machine.can_transition(&s.phase, &RestartPhaseEvent::StepFailed)
                {
                    s.phase = RestartPhase::Failed;
                }
                let mut restart = s.restart.take().unwrap_or_default();
                restart.failure = Some(message.clone());
                s.restart = Some(restart);
                s.conditions = ConditionBuilder::from_existing(s.conditions, generation)
                    .progressing(false, "RestartFailed", &message)
                    .failed(true, "RestartFailed", &message)
                    .build();
                s
            })
            .await?;

        self.events
            .publish(
                object_ref,
                EventType::Warning,
                reasons::RESTART_FAILED,
                actions::RESTART,
                Some(message),
            )
            .await;
        Ok(())
    }
}
