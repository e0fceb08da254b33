//! PodDisruptionBudget resource generation for PostgreSQL clusters
//!
//! Protects cluster availability during node maintenance. A single-instance
//! cluster gets no budget: blocking its only pod would stall node drains
//! without buying any availability.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::controller::error::Result;
use crate::resources::common::{cluster_labels, names, owner_reference, patroni_labels};
use crate::resources::desired::DesiredObject;
use crate::resources::registry::GenerationContext;

/// Generate a PodDisruptionBudget keeping at least one member available
pub fn generate_pdb(ctx: &GenerationContext<'_>) -> PodDisruptionBudget {
    let name = ctx.name();

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(names::disruption_budget(&name)),
            namespace: Some(ctx.namespace()),
            labels: Some(cluster_labels(ctx.cluster)),
            owner_references: Some(vec![owner_reference(ctx.cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(patroni_labels(&name)),
                ..Default::default()
            }),
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Operator versions before 1.1 did not manage disruption budgets
pub fn no_disruption_budget(_ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    Ok(Vec::new())
}

pub fn disruption_budget_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    if ctx.cluster.spec.instances > 1 {
        Ok(vec![DesiredObject::from_resource(&generate_pdb(ctx))?])
    } else {
        Ok(Vec::new())
    }
}
