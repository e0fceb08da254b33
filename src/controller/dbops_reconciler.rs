//! Reconciliation of PostgresDbOps resources
//!
//! An operation runs its restart under the per-cluster restart lock. Completed
//! operations are left alone; failed ones are retried while `opRetries` stays
//! below `maxRetries`, resuming from the plan persisted in their status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::lock::KeyedLock;
use crate::controller::reconciler::{operator_version, postgres_config, requeue_after_error};
use crate::controller::restart::{
    RestartHandler, RestartPhaseEvent, RestartStateMachine, TransitionContext, TransitionResult,
};
use crate::controller::status::{ConditionBuilder, StatusManager};
use crate::crd::{PostgresDbOps, RestartPhase};
use crate::resources::GenerationContext;
use crate::resources::patroni::instance_template;

#[instrument(skip(dbops, ctx), fields(name = %dbops.name_any(), namespace = dbops.namespace().unwrap_or_default()))]
pub async fn reconcile_dbops(dbops: Arc<PostgresDbOps>, ctx: Arc<Context>) -> Result<Action> {
    let ns = dbops
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = dbops.name_any();

    if dbops.metadata.deletion_timestamp.is_some() {
        debug!("Operation is being deleted");
        return Ok(Action::await_change());
    }

    let status = StatusManager::new(ctx.status_store.as_ref(), &ns, ctx.config.status_update_retries);
    let current = dbops.status.clone().unwrap_or_default();

    match current.phase {
        RestartPhase::Completed => return Ok(Action::await_change()),
        RestartPhase::Failed => return retry_failed(&dbops, &status).await,
        _ => {}
    }

    if current.op_started.is_none() {
        let started = Utc::now().to_rfc3339();
        status
            .update_operation(&name, |mut s| {
                s.op_started.get_or_insert_with(|| started.clone());
                s
            })
            .await?;
    }

    let lock_key = KeyedLock::dbops_key(&ns, &dbops.spec.cluster);
    if ctx.locks.is_locked(&lock_key) {
        debug!(cluster = %dbops.spec.cluster, "Another operation is restarting this cluster, waiting");
    }
    let _guard = ctx.locks.lock(&lock_key).await;

    // A pass that held the lock may have moved the operation on
    let Some(dbops) = ctx.status_store.get_operation(&ns, &name).await? else {
        return Ok(Action::await_change());
    };
    if dbops
        .status
        .as_ref()
        .is_some_and(|s| s.phase.is_terminal())
    {
        return Ok(Action::await_change());
    }

    let cluster = ctx
        .status_store
        .get_cluster(&ns, &dbops.spec.cluster)
        .await?
        .ok_or_else(|| Error::NotFound(format!("PostgresCluster {}/{}", ns, dbops.spec.cluster)))?;

    let version = operator_version(&cluster)?;
    let config = postgres_config(ctx.api.as_ref(), &cluster).await?;
    let mut gen_ctx = GenerationContext::new(&cluster, version);
    if let Some(config) = &config {
        gen_ctx = gen_ctx.with_postgres_config(config);
    }
    let template = instance_template(&gen_ctx)?;

    info!(cluster = %dbops.spec.cluster, op = %dbops.spec.op, method = %dbops.spec.restart.method, "Running operation");

    let mut handler = RestartHandler::new(
        ctx.instance_ops.as_ref(),
        ctx.status_store.as_ref(),
        ctx.events.as_ref(),
        ctx.config.status_update_retries,
    );
    if let Some(metrics) = ctx.metrics() {
        handler = handler.with_metrics(metrics);
    }

    match handler.restart_cluster(&dbops, &template).await {
        Ok(state) => {
            ctx.retries.reset(&lock_key);
            info!(restarted = ?state.restarted_instances, "Operation completed");
            Ok(Action::await_change())
        }
        Err(Error::Cancelled(_)) => Ok(Action::await_change()),
        // Failed is recorded; the status change triggers the retry decision
        Err(e) if !e.is_retryable() => Ok(Action::await_change()),
        Err(e) => Err(e),
    }
}

/// Move a failed operation back to Initialized while retries remain
async fn retry_failed(dbops: &PostgresDbOps, status: &StatusManager<'_>) -> Result<Action> {
    let op_retries = dbops.status.as_ref().map(|s| s.op_retries).unwrap_or_default();
    let ctx = TransitionContext::default().with_retries(op_retries, dbops.spec.max_retries);

    match RestartStateMachine::new().transition(
        &RestartPhase::Failed,
        RestartPhaseEvent::RetryRequested,
        &ctx,
    ) {
        TransitionResult::Success { to, .. } => {
            let generation = dbops.metadata.generation;
            let message = format!("Retry {} of {}", op_retries + 1, dbops.spec.max_retries);
            status
                .update_operation(&dbops.name_any(), |mut s| {
                    s.op_retries += 1;
                    s.phase = to;
                    if let Some(restart) = s.restart.as_mut() {
                        restart.failure = None;
                    }
                    s.conditions = ConditionBuilder::from_existing(s.conditions, generation)
                        .failed(false, "RetryRequested", &message)
                        .progressing(true, "RetryRequested", &message)
                        .build();
                    s
                })
                .await?;
            info!(%message, "Retrying failed operation");
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        TransitionResult::GuardFailed { reason, .. } => {
            debug!(%reason, "Operation stays failed");
            Ok(Action::await_change())
        }
        TransitionResult::InvalidTransition { .. } => Ok(Action::await_change()),
    }
}

/// Error policy for the operation controller
pub fn dbops_error_policy(dbops: Arc<PostgresDbOps>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = KeyedLock::dbops_key(&dbops.namespace().unwrap_or_default(), &dbops.spec.cluster);
    requeue_after_error(&ctx, &key, error)
}
