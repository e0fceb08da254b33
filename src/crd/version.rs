//! Operator schema versions
//!
//! A `PostgresCluster` declares the operator release whose resource layout it
//! expects through the `pgcluster.dev/operator-version` annotation. Resource
//! factories bind to half-open intervals of these versions.

use std::fmt;
use std::str::FromStr;

use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// Annotation carrying the declared operator schema version
pub const OPERATOR_VERSION_ANNOTATION: &str = "pgcluster.dev/operator-version";

/// Released operator schema versions, totally ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperatorVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl OperatorVersion {
    /// Most recent schema version, used when a cluster declares none
    pub const LATEST: OperatorVersion = OperatorVersion::V1_2;

    /// All known versions in ascending order
    pub const ALL: [OperatorVersion; 3] = [
        OperatorVersion::V1_0,
        OperatorVersion::V1_1,
        OperatorVersion::V1_2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorVersion::V1_0 => "1.0",
            OperatorVersion::V1_1 => "1.1",
            OperatorVersion::V1_2 => "1.2",
        }
    }

    /// Resolve the schema version declared by a cluster
    ///
    /// Returns the unparsed annotation value on failure so the caller can
    /// report it.
    pub fn of_cluster(cluster: &PostgresCluster) -> Result<Self, String> {
        match cluster.annotations().get(OPERATOR_VERSION_ANNOTATION) {
            Some(value) => value.parse(),
            None => Ok(Self::LATEST),
        }
    }
}

impl fmt::Display for OperatorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| s.to_string())
    }
}

/// Half-open version interval `[start_at, stop_at)`
///
/// `stop_at = None` leaves the interval open towards future releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub start_at: OperatorVersion,
    pub stop_at: Option<OperatorVersion>,
}

impl VersionRange {
    pub const fn new(start_at: OperatorVersion, stop_at: OperatorVersion) -> Self {
        Self {
            start_at,
            stop_at: Some(stop_at),
        }
    }

    pub const fn from(start_at: OperatorVersion) -> Self {
        Self {
            start_at,
            stop_at: None,
        }
    }

    pub fn contains(&self, version: OperatorVersion) -> bool {
        version >= self.start_at && self.stop_at.is_none_or(|stop| version < stop)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stop_at {
            Some(stop) => write!(f, "[{}, {})", self.start_at, stop),
            None => write!(f, "[{}, *)", self.start_at),
        }
    }
}
