//! Reconciliation of PostgresCluster resources
//!
//! A pass generates the desired objects, lists the live objects carrying the
//! cluster's labels and converges them: create what is missing, patch what
//! changed, delete what is owned but no longer desired. Planning is a pure
//! function of (desired, live); only `ResourceReconciler::apply` writes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::client::ClusterApi;
use crate::controller::comparator::ComparatorSet;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::{actions, reasons};
use crate::controller::lock::KeyedLock;
use crate::controller::status::{ConditionBuilder, StatusManager};
use crate::controller::validation::validate_spec;
use crate::crd::{ClusterPhase, OperatorVersion, PostgresCluster};
use crate::health::Metrics;
use crate::resources::common::owned_selector;
use crate::resources::{DesiredObject, FactoryRegistry, GenerationContext, LiveObject, ObjectKey};

/// One write the reconciler decided on
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOperation {
    Create(DesiredObject),
    Patch {
        desired: DesiredObject,
        live: LiveObject,
    },
    Delete(LiveObject),
}

impl ReconcileOperation {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ReconcileOperation::Create(desired) => &desired.key,
            ReconcileOperation::Patch { desired, .. } => &desired.key,
            ReconcileOperation::Delete(live) => &live.key,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            ReconcileOperation::Create(_) => "create",
            ReconcileOperation::Patch { .. } => "patch",
            ReconcileOperation::Delete(_) => "delete",
        }
    }
}

/// Writes needed to converge live state, plus what was left alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub operations: Vec<ReconcileOperation>,
    /// Desired objects whose live copy has no significant difference
    pub unchanged: Vec<ObjectKey>,
    /// Undesired live objects the cluster does not own, or that are terminating
    pub untouched: Vec<ObjectKey>,
}

/// Compare desired and live objects
///
/// Creates and patches come first in key order, deletes last.
pub fn plan(
    desired: Vec<DesiredObject>,
    live: Vec<LiveObject>,
    comparators: &ComparatorSet,
    owner_uid: &str,
) -> ReconcilePlan {
    let mut live: BTreeMap<ObjectKey, LiveObject> =
        live.into_iter().map(|l| (l.key.clone(), l)).collect();
    let mut result = ReconcilePlan::default();

    for object in desired {
        match live.remove(&object.key) {
            None => result.operations.push(ReconcileOperation::Create(object)),
            Some(existing) if comparators.has_changed(&object, &existing) => {
                result.operations.push(ReconcileOperation::Patch {
                    desired: object,
                    live: existing,
                })
            }
            Some(_) => result.unchanged.push(object.key),
        }
    }

    for (key, existing) in live {
        if comparators.is_deletable(&existing, owner_uid) {
            if comparators.has_finalizers(&existing) {
                debug!(%key, "Deleting object with finalizers, removal completes when they clear");
            }
            result.operations.push(ReconcileOperation::Delete(existing));
        } else {
            debug!(%key, "Leaving live object alone");
            result.untouched.push(key);
        }
    }

    result
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub key: ObjectKey,
    pub verb: &'static str,
}

/// Outcome of one pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub applied: Vec<AppliedOperation>,
    pub skipped: Vec<ObjectKey>,
    /// `Error::ApplyFailure` per object that could not be written
    pub failed: Vec<Error>,
}

impl ReconcileReport {
    pub fn is_partial_failure(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Generate-diff-apply over the `ClusterApi` seam
pub struct ResourceReconciler<'a> {
    api: &'a dyn ClusterApi,
    registry: &'a FactoryRegistry,
    comparators: &'a ComparatorSet,
    metrics: Option<&'a Metrics>,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(
        api: &'a dyn ClusterApi,
        registry: &'a FactoryRegistry,
        comparators: &'a ComparatorSet,
    ) -> Self {
        Self {
            api,
            registry,
            comparators,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<&'a Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn generate(&self, ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
        self.registry.generate(ctx)
    }

    /// Converge the live objects of a cluster towards `desired`
    ///
    /// A conflict aborts the pass; any other write error is recorded and the
    /// remaining operations still run.
    pub async fn apply(
        &self,
        cluster: &PostgresCluster,
        desired: Vec<DesiredObject>,
    ) -> Result<ReconcileReport> {
        let namespace = cluster
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let owner_uid = cluster
            .uid()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        let live = self
            .api
            .list_owned(&namespace, &owned_selector(&cluster.name_any()))
            .await?;
        let planned = plan(desired, live, self.comparators, &owner_uid);
        debug!(
            operations = planned.operations.len(),
            unchanged = planned.unchanged.len(),
            untouched = planned.untouched.len(),
            "Planned reconciliation"
        );

        let mut report = ReconcileReport {
            skipped: planned.unchanged,
            ..Default::default()
        };

        for operation in planned.operations {
            let key = operation.key().clone();
            let verb = operation.verb();
            let result = match &operation {
                ReconcileOperation::Create(desired) => self.api.create(desired).await.map(|_| ()),
                ReconcileOperation::Patch { desired, live } => self
                    .api
                    .patch(desired, live.resource_version.clone())
                    .await
                    .map(|_| ()),
                ReconcileOperation::Delete(live) => self.api.delete(live).await,
            };

            match result {
                Ok(()) => {
                    info!(%key, verb, "Applied object");
                    if let Some(metrics) = self.metrics {
                        metrics.record_apply(&key.kind, verb);
                    }
                    report.applied.push(AppliedOperation { key, verb });
                }
                Err(e) if e.is_conflict() => {
                    warn!(%key, verb, "Conflict, aborting pass");
                    return Err(e);
                }
                Err(e) => {
                    warn!(%key, verb, error = %e, "Failed to apply object");
                    if let Some(metrics) = self.metrics {
                        metrics.record_apply(&key.kind, "failed");
                    }
                    report.failed.push(Error::ApplyFailure {
                        key: key.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Generate and apply in one call
    pub async fn reconcile(&self, ctx: &GenerationContext<'_>) -> Result<ReconcileReport> {
        let desired = self.generate(ctx)?;
        self.apply(ctx.cluster, desired).await
    }
}

/// Data of the ConfigMap named by `spec.configuration.postgresConfig`
pub(crate) async fn postgres_config(
    api: &dyn ClusterApi,
    cluster: &PostgresCluster,
) -> Result<Option<BTreeMap<String, String>>> {
    let Some(name) = &cluster.spec.configuration.postgres_config else {
        return Ok(None);
    };
    let key = ObjectKey::new("ConfigMap", cluster.namespace().unwrap_or_default(), name);
    let live = api
        .get(&key)
        .await?
        .ok_or_else(|| Error::ConfigurationError(format!("{} referenced by postgresConfig not found", key)))?;
    let data = match live.payload.get("data") {
        Some(data) if !data.is_null() => serde_json::from_value(data.clone())?,
        _ => BTreeMap::new(),
    };
    Ok(Some(data))
}

pub(crate) fn operator_version(cluster: &PostgresCluster) -> Result<OperatorVersion> {
    OperatorVersion::of_cluster(cluster)
        .map_err(|value| Error::ConfigurationError(format!("unknown operator version {:?}", value)))
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = cluster.name_any();

    // Owned objects are garbage collected through their owner references
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("Cluster is being deleted");
        return Ok(Action::await_change());
    }

    let _guard = ctx.locks.lock(&KeyedLock::cluster_key(&ns, &name)).await;
    let result = reconcile_cluster(&cluster, &ctx, &ns).await;

    match &result {
        Ok(_) => {
            ctx.retries.reset(&KeyedLock::cluster_key(&ns, &name));
            if let Some(metrics) = ctx.metrics() {
                metrics.record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
            }
        }
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
            if let Some(metrics) = ctx.metrics() {
                metrics.record_error(&ns, &name);
            }
        }
    }
    result
}

async fn reconcile_cluster(cluster: &PostgresCluster, ctx: &Context, ns: &str) -> Result<Action> {
    let name = cluster.name_any();
    let generation = cluster.metadata.generation;
    let status = StatusManager::new(ctx.status_store.as_ref(), ns, ctx.config.status_update_retries);
    let reconciler =
        ResourceReconciler::new(ctx.api.as_ref(), &ctx.registry, &ctx.comparators)
            .with_metrics(ctx.metrics());

    let generated = async {
        validate_spec(cluster)?;
        let version = operator_version(cluster)?;
        let config = postgres_config(ctx.api.as_ref(), cluster).await?;
        let mut gen_ctx = GenerationContext::new(cluster, version);
        if let Some(config) = &config {
            gen_ctx = gen_ctx.with_postgres_config(config);
        }
        debug!(%version, "Generating desired state");
        reconciler.generate(&gen_ctx)
    }
    .await;

    let desired = match generated {
        Ok(desired) => desired,
        Err(e) if e.is_retryable() => return Err(e),
        Err(e) => {
            if let Err(write_err) = report_generation_failure(cluster, ctx, &status, &e).await {
                warn!(error = %write_err, "Could not record generation failure");
            }
            return Err(e);
        }
    };
    let generated_count = desired.len();

    let report = reconciler.apply(cluster, desired).await?;
    let degraded = report.is_partial_failure();
    let failed_count = report.failed.len();
    let instances = cluster.spec.instances;

    status
        .update_cluster(&name, |_, mut s| {
            s.phase = if degraded {
                ClusterPhase::Degraded
            } else {
                ClusterPhase::Reconciled
            };
            s.instances = instances;
            s.observed_generation = generation;
            let builder = ConditionBuilder::from_existing(s.conditions, generation).config_valid(
                true,
                "DesiredStateGenerated",
                &format!("{} objects generated", generated_count),
            );
            s.conditions = if degraded {
                let message = format!("{} objects could not be applied", failed_count);
                builder
                    .ready(false, "ApplyFailed", &message)
                    .degraded(true, "ApplyFailed", &message)
                    .build()
            } else {
                builder
                    .ready(true, "Reconciled", "All objects match the desired state")
                    .degraded(false, "Reconciled", "")
                    .build()
            };
            s
        })
        .await?;

    publish_report(cluster, ctx, &report).await;
    if let Some(metrics) = ctx.metrics() {
        metrics.set_cluster_instances(ns, &name, i64::from(instances));
    }

    info!(
        applied = report.applied.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Reconciliation completed"
    );

    if degraded {
        Ok(Action::requeue(BackoffConfig::default().initial_delay))
    } else {
        Ok(Action::requeue(ctx.config.resync_interval))
    }
}

/// Surface a generation-stage failure on the cluster
async fn report_generation_failure(
    cluster: &PostgresCluster,
    ctx: &Context,
    status: &StatusManager<'_>,
    cause: &Error,
) -> Result<()> {
    let message = cause.to_string();
    let generation = cluster.metadata.generation;
    warn!(error = %message, "Desired state could not be generated");

    status
        .update_cluster(&cluster.name_any(), |_, mut s| {
            s.phase = ClusterPhase::Failed;
            s.observed_generation = generation;
            s.conditions = ConditionBuilder::from_existing(s.conditions, generation)
                .config_valid(false, "GenerationFailed", &message)
                .ready(false, "GenerationFailed", &message)
                .build();
            s
        })
        .await?;

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Warning,
            reasons::CLUSTER_CONFIG_FAILED,
            actions::RECONCILE,
            Some(message),
        )
        .await;
    Ok(())
}

async fn publish_report(cluster: &PostgresCluster, ctx: &Context, report: &ReconcileReport) {
    let object_ref = cluster.object_ref(&());

    if !report.applied.is_empty() {
        let first_pass = cluster
            .status
            .as_ref()
            .and_then(|s| s.observed_generation)
            .is_none();
        let reason = if first_pass {
            reasons::CLUSTER_CREATED
        } else {
            reasons::CLUSTER_UPDATED
        };
        let note = report
            .applied
            .iter()
            .map(|a| format!("{} {}", a.verb, a.key))
            .collect::<Vec<_>>()
            .join(", ");
        ctx.events
            .publish(&object_ref, EventType::Normal, reason, actions::RECONCILE, Some(note))
            .await;
    }

    for failure in &report.failed {
        ctx.events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::APPLY_FAILED,
                actions::RECONCILE,
                Some(failure.to_string()),
            )
            .await;
    }
}

/// Error policy for the cluster controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = KeyedLock::cluster_key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
    requeue_after_error(&ctx, &key, error)
}

pub(crate) fn requeue_after_error(ctx: &Context, key: &str, error: &Error) -> Action {
    let attempt = ctx.retries.next_attempt(key);
    let delay: Duration = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(%key, attempt, error = %error, "Retryable error, requeuing in {:?}", delay);
    } else {
        error!(%key, error = %error, "Non-retryable error, requeuing in {:?} for manual intervention", delay);
    }

    Action::requeue(delay)
}
