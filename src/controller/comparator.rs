//! Per-kind comparison of desired and live objects
//!
//! The diff is computed from the desired payload to the live payload, so a
//! field the API server or another controller filled in shows up as an `add`
//! and a field the operator dropped shows up as a `remove`. Ignore rules
//! suppress the differences the operator must not fight over.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;
use serde_json::Value;
use tracing::trace;

use crate::controller::error::{Error, Result};
use crate::resources::{DesiredObject, LiveObject};

/// JSON patch operation kinds an ignore rule can match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
    /// Matches every operation
    Any,
}

impl PatchOp {
    fn matches(&self, op: &str) -> bool {
        match self {
            PatchOp::Add => op == "add",
            PatchOp::Remove => op == "remove",
            PatchOp::Replace => op == "replace",
            PatchOp::Any => true,
        }
    }
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOp::Add => write!(f, "add"),
            PatchOp::Remove => write!(f, "remove"),
            PatchOp::Replace => write!(f, "replace"),
            PatchOp::Any => write!(f, "*"),
        }
    }
}

/// A (path pattern, operation) pair whose matching differences are ignored
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    path: Regex,
    op: PatchOp,
}

impl IgnoreRule {
    pub fn new(pattern: &str, op: PatchOp) -> Result<Self> {
        let path = Regex::new(pattern).map_err(|e| {
            Error::ConfigurationError(format!("invalid ignore rule {}: {}", pattern, e))
        })?;
        Ok(Self { path, op })
    }

    pub fn matches(&self, difference: &Difference) -> bool {
        self.op.matches(&difference.op) && self.path.is_match(&difference.path)
    }
}

/// One operation of the desired-to-live patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    pub op: String,
    pub path: String,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.path)
    }
}

/// Structural differences between two payloads
pub fn differences(desired: &Value, live: &Value) -> Vec<Difference> {
    json_patch::diff(desired, live)
        .0
        .iter()
        .filter_map(|operation| serde_json::to_value(operation).ok())
        .filter_map(|operation| {
            Some(Difference {
                op: operation.get("op")?.as_str()?.to_string(),
                path: operation.get("path")?.as_str()?.to_string(),
            })
        })
        .collect()
}

/// Comparator for one object kind
#[derive(Debug, Clone, Default)]
pub struct Comparator {
    rules: Vec<IgnoreRule>,
}

impl Comparator {
    pub fn new(rules: Vec<IgnoreRule>) -> Self {
        Self { rules }
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = IgnoreRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Differences left after the ignore rules are applied
    pub fn significant_differences(&self, desired: &Value, live: &Value) -> Vec<Difference> {
        differences(desired, live)
            .into_iter()
            .filter(|d| !self.rules.iter().any(|rule| rule.matches(d)))
            .collect()
    }

    pub fn has_changed(&self, desired: &DesiredObject, live: &LiveObject) -> bool {
        let remaining = self.significant_differences(&desired.payload, &live.payload);
        for difference in &remaining {
            trace!(object = %desired.key, %difference, "Significant difference");
        }
        !remaining.is_empty()
    }
}

fn rules(specs: &[(&str, PatchOp)]) -> Result<Vec<IgnoreRule>> {
    specs
        .iter()
        .map(|(pattern, op)| IgnoreRule::new(pattern, *op))
        .collect()
}

/// Fields every kind receives from the API server
fn base_rules() -> Result<Vec<IgnoreRule>> {
    rules(&[
        (
            r"^/metadata/(uid|resourceVersion|generation|creationTimestamp|managedFields|selfLink)$",
            PatchOp::Add,
        ),
        (r"^/metadata/annotations(/.*)?$", PatchOp::Add),
        (r"^/status(/.*)?$", PatchOp::Any),
    ])
}

fn service_rules() -> Result<Vec<IgnoreRule>> {
    rules(&[
        (
            r"^/spec/(clusterIP|clusterIPs|ipFamilies|ipFamilyPolicy|sessionAffinity|internalTrafficPolicy)$",
            PatchOp::Add,
        ),
        (r"^/spec/ports/\d+/(protocol|nodePort)$", PatchOp::Add),
    ])
}

/// Patroni writes the leader into the subsets and its state into annotations
fn endpoints_rules() -> Result<Vec<IgnoreRule>> {
    rules(&[
        (r"^/subsets$", PatchOp::Add),
        (r"^/subsets/.*$", PatchOp::Replace),
        (r"^/metadata/annotations(/.*)?$", PatchOp::Replace),
    ])
}

fn statefulset_rules() -> Result<Vec<IgnoreRule>> {
    rules(&[
        (
            r"^/spec/(revisionHistoryLimit|podManagementPolicy|updateStrategy|persistentVolumeClaimRetentionPolicy)(/.*)?$",
            PatchOp::Add,
        ),
        (r"^/spec/template/metadata/creationTimestamp$", PatchOp::Add),
        (
            r"^/spec/template/spec/(dnsPolicy|restartPolicy|schedulerName|securityContext|terminationGracePeriodSeconds)$",
            PatchOp::Add,
        ),
        // Deprecated alias the API server copies from serviceAccountName
        (r"^/spec/template/spec/serviceAccount$", PatchOp::Add),
        (
            r"^/spec/template/spec/containers/\d+/(terminationMessagePath|terminationMessagePolicy|imagePullPolicy)$",
            PatchOp::Add,
        ),
        (r"^/spec/template/spec/containers/\d+/resources$", PatchOp::Add),
        (
            r"^/spec/template/spec/containers/\d+/(readinessProbe|livenessProbe)/(successThreshold|failureThreshold|timeoutSeconds|periodSeconds|httpGet/scheme)$",
            PatchOp::Add,
        ),
        (r"^/spec/template/spec/containers/\d+/ports/\d+/protocol$", PatchOp::Add),
        (
            r"^/spec/template/spec/containers/\d+/env/\d+/valueFrom/fieldRef/apiVersion$",
            PatchOp::Add,
        ),
        (
            r"^/spec/template/spec/volumes/\d+/(configMap|secret)/defaultMode$",
            PatchOp::Add,
        ),
        (
            r"^/spec/volumeClaimTemplates/\d+/(apiVersion|kind|status)$",
            PatchOp::Add,
        ),
        (
            r"^/spec/volumeClaimTemplates/\d+/metadata/creationTimestamp$",
            PatchOp::Add,
        ),
        (r"^/spec/volumeClaimTemplates/\d+/spec/volumeMode$", PatchOp::Add),
    ])
}

fn service_account_rules() -> Result<Vec<IgnoreRule>> {
    rules(&[(r"^/secrets$", PatchOp::Add)])
}

/// Comparators for every managed kind
#[derive(Debug, Clone)]
pub struct ComparatorSet {
    default: Comparator,
    by_kind: HashMap<String, Comparator>,
}

impl ComparatorSet {
    /// Comparators with the rules for the kinds the factories emit
    pub fn standard() -> Result<Self> {
        let default = Comparator::new(base_rules()?);
        let by_kind = HashMap::from([
            (
                "Service".to_string(),
                default.clone().with_rules(service_rules()?),
            ),
            (
                "Endpoints".to_string(),
                default.clone().with_rules(endpoints_rules()?),
            ),
            (
                "StatefulSet".to_string(),
                default.clone().with_rules(statefulset_rules()?),
            ),
            (
                "ServiceAccount".to_string(),
                default.clone().with_rules(service_account_rules()?),
            ),
        ]);
        Ok(Self { default, by_kind })
    }

    /// Replace the comparator of one kind
    pub fn with_comparator(mut self, kind: impl Into<String>, comparator: Comparator) -> Self {
        self.by_kind.insert(kind.into(), comparator);
        self
    }

    pub fn for_kind(&self, kind: &str) -> &Comparator {
        self.by_kind.get(kind).unwrap_or(&self.default)
    }

    pub fn has_changed(&self, desired: &DesiredObject, live: &LiveObject) -> bool {
        self.for_kind(&desired.key.kind).has_changed(desired, live)
    }

    /// The live object carries a controller reference to the given owner
    pub fn is_owned_by(&self, live: &LiveObject, owner_uid: &str) -> bool {
        live.owner_references()
            .iter()
            .any(|r| r.controller == Some(true) && r.uid == owner_uid)
    }

    pub fn has_finalizers(&self, live: &LiveObject) -> bool {
        !live.finalizers().is_empty()
    }

    /// Owned, and not already being removed
    pub fn is_deletable(&self, live: &LiveObject, owner_uid: &str) -> bool {
        self.is_owned_by(live, owner_uid) && !live.is_terminating()
    }
}
