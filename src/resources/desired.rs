//! Desired and live object descriptors
//!
//! Factories emit typed `k8s_openapi` objects; the generator erases them into
//! `DesiredObject`s keyed by (kind, namespace, name) so the comparator and the
//! reconciler can work on every kind uniformly.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;

use crate::controller::error::{Error, Result};

/// Identity of a managed object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// An object the operator wants to exist, with its full payload
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObject {
    pub key: ObjectKey,
    pub api_version: String,
    pub payload: Value,
}

impl DesiredObject {
    /// Erase a typed resource into a desired object
    pub fn from_resource<K>(resource: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let name = resource
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = resource
            .meta()
            .namespace
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

        let mut payload = serde_json::to_value(resource)?;
        if let Value::Object(map) = &mut payload {
            map.insert("apiVersion".into(), Value::String(K::api_version(&()).into()));
            map.insert("kind".into(), Value::String(K::kind(&()).into()));
        }

        Ok(Self {
            key: ObjectKey::new(K::kind(&()), namespace, name),
            api_version: K::api_version(&()).into_owned(),
            payload,
        })
    }
}

/// An object as read from the API server
#[derive(Debug, Clone, PartialEq)]
pub struct LiveObject {
    pub key: ObjectKey,
    pub resource_version: Option<String>,
    pub payload: Value,
}

impl LiveObject {
    pub fn from_dynamic(kind: &str, object: &DynamicObject) -> Result<Self> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        let namespace = object.namespace().unwrap_or_default();

        Ok(Self {
            key: ObjectKey::new(kind, namespace, name),
            resource_version: object.metadata.resource_version.clone(),
            payload: serde_json::to_value(object)?,
        })
    }

    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.payload
            .pointer("/metadata/ownerReferences")
            .cloned()
            .and_then(|refs| serde_json::from_value(refs).ok())
            .unwrap_or_default()
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.payload
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_terminating(&self) -> bool {
        self.payload
            .pointer("/metadata/deletionTimestamp")
            .is_some_and(|ts| !ts.is_null())
    }
}
