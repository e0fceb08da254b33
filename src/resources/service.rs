//! Service generation for Patroni-managed PostgreSQL clusters
//!
//! Two layouts exist. Before operator version 1.1 the read-write service
//! selects the pod labelled `role=primary`. From 1.1 on, Patroni owns the
//! endpoints of a selectorless service named after the scope, and the
//! read-write service is an ExternalName alias of it so that clients follow
//! the leader without waiting for label propagation.

use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;

use crate::controller::error::Result;
use crate::crd::PostgresServiceSpec;
use crate::resources::common::{
    PATRONI_PORT, POSTGRES_PORT, PRIMARY_ROLE, REPLICA_ROLE, cluster_labels, names,
    owner_reference, patroni_labels, role_selector,
};
use crate::resources::desired::DesiredObject;
use crate::resources::registry::GenerationContext;

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        port: number,
        target_port: Some(IntOrString::Int(number)),
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn metadata(ctx: &GenerationContext<'_>, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(ctx.namespace()),
        labels: Some(cluster_labels(ctx.cluster)),
        owner_references: Some(vec![owner_reference(ctx.cluster)]),
        ..Default::default()
    }
}

fn client_metadata(
    ctx: &GenerationContext<'_>,
    name: String,
    config: &PostgresServiceSpec,
) -> ObjectMeta {
    ObjectMeta {
        annotations: if config.annotations.is_empty() {
            None
        } else {
            Some(config.annotations.clone())
        },
        ..metadata(ctx, name)
    }
}

/// Headless service governing the StatefulSet
///
/// Always ClusterIP with `clusterIP: None`, and it publishes unready pods so
/// members can reach each other while bootstrapping.
pub fn generate_config_service(ctx: &GenerationContext<'_>) -> Service {
    Service {
        metadata: metadata(ctx, names::config_service(&ctx.name())),
        spec: Some(ServiceSpec {
            selector: Some(patroni_labels(&ctx.name())),
            ports: Some(vec![
                port("postgresql", POSTGRES_PORT),
                port("patroni", PATRONI_PORT),
            ]),
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Patroni REST API of every member
pub fn generate_rest_service(ctx: &GenerationContext<'_>) -> Service {
    Service {
        metadata: metadata(ctx, names::rest_service(&ctx.name())),
        spec: Some(ServiceSpec {
            selector: Some(patroni_labels(&ctx.name())),
            ports: Some(vec![port("patroni", PATRONI_PORT)]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Selectorless service whose endpoints Patroni points at the leader
pub fn generate_patroni_service(ctx: &GenerationContext<'_>) -> Service {
    Service {
        metadata: metadata(ctx, names::patroni(&ctx.name())),
        spec: Some(ServiceSpec {
            ports: Some(vec![port("postgresql", POSTGRES_PORT)]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Endpoints of the Patroni service
///
/// Created empty; Patroni fills in the subsets and leader annotations, which
/// the Endpoints comparator ignores.
pub fn generate_patroni_endpoints(ctx: &GenerationContext<'_>) -> Endpoints {
    Endpoints {
        metadata: metadata(ctx, names::patroni(&ctx.name())),
        subsets: None,
    }
}

/// Read-write alias resolving to the Patroni service
pub fn generate_primary_alias_service(ctx: &GenerationContext<'_>) -> Service {
    let name = ctx.name();
    let config = &ctx.cluster.spec.postgres_services.primary;
    Service {
        metadata: client_metadata(ctx, names::primary_service(&name), config),
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(format!(
                "{}.{}.svc.cluster.local",
                names::patroni(&name),
                ctx.namespace()
            )),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service selecting instances by Patroni role
fn generate_role_service(
    ctx: &GenerationContext<'_>,
    name: String,
    role: &str,
    config: &PostgresServiceSpec,
) -> Service {
    Service {
        metadata: client_metadata(ctx, name, config),
        spec: Some(ServiceSpec {
            selector: Some(role_selector(&ctx.name(), role)),
            ports: Some(vec![port("postgresql", POSTGRES_PORT)]),
            type_: Some(config.type_.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read-write service selecting the primary pod directly
pub fn generate_primary_selector_service(ctx: &GenerationContext<'_>) -> Service {
    generate_role_service(
        ctx,
        names::primary_service(&ctx.name()),
        PRIMARY_ROLE,
        &ctx.cluster.spec.postgres_services.primary,
    )
}

/// Read-only service across the replicas
pub fn generate_replicas_service(ctx: &GenerationContext<'_>) -> Service {
    generate_role_service(
        ctx,
        names::replicas_service(&ctx.name()),
        REPLICA_ROLE,
        &ctx.cluster.spec.postgres_services.replicas,
    )
}

/// Services for operator versions before 1.1
pub fn legacy_services_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    let services = &ctx.cluster.spec.postgres_services;

    let mut objects = vec![DesiredObject::from_resource(&generate_config_service(ctx))?];
    if services.primary.enabled {
        objects.push(DesiredObject::from_resource(
            &generate_primary_selector_service(ctx),
        )?);
    }
    if services.replicas.enabled {
        objects.push(DesiredObject::from_resource(&generate_replicas_service(ctx))?);
    }
    Ok(objects)
}

/// Services and endpoints from operator version 1.1
pub fn patroni_services_factory(ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
    let services = &ctx.cluster.spec.postgres_services;

    // The scope service and its endpoints hold Patroni's leader lock, so
    // they exist even when the read-write alias is disabled
    let mut objects = vec![
        DesiredObject::from_resource(&generate_config_service(ctx))?,
        DesiredObject::from_resource(&generate_rest_service(ctx))?,
        DesiredObject::from_resource(&generate_patroni_service(ctx))?,
        DesiredObject::from_resource(&generate_patroni_endpoints(ctx))?,
    ];
    if services.primary.enabled {
        objects.push(DesiredObject::from_resource(
            &generate_primary_alias_service(ctx),
        )?);
    }
    if services.replicas.enabled {
        objects.push(DesiredObject::from_resource(&generate_replicas_service(ctx))?);
    }
    Ok(objects)
}
