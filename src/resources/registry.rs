//! Version-gated factory registry and desired-state generation
//!
//! Each factory kind maps to an ordered list of `(VersionRange, generator)`
//! pairs. For a given cluster exactly one generator per kind must match the
//! cluster's declared operator version; the intervals of a kind therefore
//! partition the version space.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kube::ResourceExt;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{OperatorVersion, PostgresCluster, VersionRange};
use crate::resources::desired::{DesiredObject, ObjectKey};
use crate::resources::{patroni, pdb, service};

/// Everything a factory may read
///
/// Referenced objects are resolved by the caller before generation so
/// factories never touch the API server.
#[derive(Debug, Clone, Copy)]
pub struct GenerationContext<'a> {
    pub cluster: &'a PostgresCluster,
    pub version: OperatorVersion,
    /// Data of the ConfigMap named by `spec.configuration.postgresConfig`
    pub postgres_config: Option<&'a BTreeMap<String, String>>,
}

impl<'a> GenerationContext<'a> {
    pub fn new(cluster: &'a PostgresCluster, version: OperatorVersion) -> Self {
        Self {
            cluster,
            version,
            postgres_config: None,
        }
    }

    pub fn with_postgres_config(mut self, config: &'a BTreeMap<String, String>) -> Self {
        self.postgres_config = Some(config);
        self
    }

    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }
}

/// Groups of objects produced together by one generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FactoryKind {
    PatroniConfig,
    PatroniRbac,
    PatroniStatefulSet,
    PatroniServices,
    DisruptionBudget,
}

impl fmt::Display for FactoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactoryKind::PatroniConfig => write!(f, "PatroniConfig"),
            FactoryKind::PatroniRbac => write!(f, "PatroniRbac"),
            FactoryKind::PatroniStatefulSet => write!(f, "PatroniStatefulSet"),
            FactoryKind::PatroniServices => write!(f, "PatroniServices"),
            FactoryKind::DisruptionBudget => write!(f, "DisruptionBudget"),
        }
    }
}

pub type Generator = fn(&GenerationContext<'_>) -> Result<Vec<DesiredObject>>;

/// A generator bound to a version interval
#[derive(Clone, Copy)]
pub struct VersionedFactory {
    pub range: VersionRange,
    pub generate: Generator,
}

impl fmt::Debug for VersionedFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedFactory")
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// Dispatch table from factory kind to versioned generators
#[derive(Debug, Clone, Default)]
pub struct FactoryRegistry {
    factories: BTreeMap<FactoryKind, Vec<VersionedFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of every factory the operator ships
    pub fn standard() -> Self {
        use OperatorVersion::*;

        Self::new()
            .register(
                FactoryKind::PatroniConfig,
                VersionRange::new(V1_0, V1_2),
                patroni::legacy_config_factory,
            )
            .register(
                FactoryKind::PatroniConfig,
                VersionRange::from(V1_2),
                patroni::config_factory,
            )
            .register(
                FactoryKind::PatroniRbac,
                VersionRange::from(V1_0),
                patroni::rbac_factory,
            )
            .register(
                FactoryKind::PatroniStatefulSet,
                VersionRange::from(V1_0),
                patroni::statefulset_factory,
            )
            .register(
                FactoryKind::PatroniServices,
                VersionRange::new(V1_0, V1_1),
                service::legacy_services_factory,
            )
            .register(
                FactoryKind::PatroniServices,
                VersionRange::from(V1_1),
                service::patroni_services_factory,
            )
            .register(
                FactoryKind::DisruptionBudget,
                VersionRange::new(V1_0, V1_1),
                pdb::no_disruption_budget,
            )
            .register(
                FactoryKind::DisruptionBudget,
                VersionRange::from(V1_1),
                pdb::disruption_budget_factory,
            )
    }

    pub fn register(mut self, kind: FactoryKind, range: VersionRange, generate: Generator) -> Self {
        self.factories
            .entry(kind)
            .or_default()
            .push(VersionedFactory { range, generate });
        self
    }

    /// Select the single generator per kind whose interval contains `version`
    pub fn resolve(&self, version: OperatorVersion) -> Result<Vec<(FactoryKind, Generator)>> {
        self.factories
            .iter()
            .map(|(kind, candidates)| {
                let matching: Vec<_> = candidates
                    .iter()
                    .filter(|f| f.range.contains(version))
                    .collect();
                match matching.as_slice() {
                    [factory] => Ok((*kind, factory.generate)),
                    [] => Err(Error::ConfigurationError(format!(
                        "no {} factory covers operator version {}",
                        kind, version
                    ))),
                    many => Err(Error::ConfigurationError(format!(
                        "{} {} factories match operator version {}: {}",
                        many.len(),
                        kind,
                        version,
                        many.iter()
                            .map(|f| f.range.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))),
                }
            })
            .collect()
    }

    /// Generate the complete desired state for a cluster
    ///
    /// The result is sorted by key. Two generators emitting the same key is a
    /// configuration error.
    pub fn generate(&self, ctx: &GenerationContext<'_>) -> Result<Vec<DesiredObject>> {
        let generators = self.resolve(ctx.version)?;

        let mut seen = BTreeSet::<ObjectKey>::new();
        let mut desired = Vec::new();
        for (kind, generate) in generators {
            let objects = generate(ctx)?;
            debug!(factory = %kind, count = objects.len(), "Generated objects");
            for object in objects {
                if !seen.insert(object.key.clone()) {
                    return Err(Error::ConfigurationError(format!(
                        "duplicate desired object {} emitted by {}",
                        object.key, kind
                    )));
                }
                desired.push(object);
            }
        }

        desired.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(desired)
    }
}
