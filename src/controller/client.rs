//! Cluster API seam for the reconciler
//!
//! The reconciler only sees type-erased objects. `KubeClusterApi` maps them
//! onto `DynamicObject` APIs for the kinds the factories emit.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    Preconditions,
};
use kube::core::TypeMeta;
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::controller::error::{Error, Result};
use crate::resources::common::FIELD_MANAGER;
use crate::resources::{DesiredObject, LiveObject, ObjectKey};

/// Object store operations the reconciler needs
///
/// Writes carry the expected resource version; a mismatch surfaces as
/// `Error::ApplyConflict`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List objects of every managed kind matching a label selector
    async fn list_owned(&self, namespace: &str, selector: &str) -> Result<Vec<LiveObject>>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>>;

    async fn create(&self, desired: &DesiredObject) -> Result<LiveObject>;

    async fn patch(
        &self,
        desired: &DesiredObject,
        resource_version: Option<String>,
    ) -> Result<LiveObject>;

    async fn delete(&self, live: &LiveObject) -> Result<()>;
}

/// Kinds the operator creates and therefore lists when reconciling
pub fn managed_resources() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<ConfigMap>(&()),
        ApiResource::erase::<Endpoints>(&()),
        ApiResource::erase::<PodDisruptionBudget>(&()),
        ApiResource::erase::<Role>(&()),
        ApiResource::erase::<RoleBinding>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<ServiceAccount>(&()),
        ApiResource::erase::<StatefulSet>(&()),
    ]
}

/// `ClusterApi` backed by the Kubernetes API server
pub struct KubeClusterApi {
    client: Client,
    resources: Vec<ApiResource>,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: managed_resources(),
        }
    }

    fn resource(&self, kind: &str) -> Result<&ApiResource> {
        self.resources
            .iter()
            .find(|r| r.kind == kind)
            .ok_or_else(|| Error::ConfigurationError(format!("unmanaged kind {}", kind)))
    }

    fn api(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

/// List responses omit the type of each item
fn typed(mut object: DynamicObject, resource: &ApiResource) -> DynamicObject {
    object.types = Some(TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    });
    object
}

fn write_error(key: &ObjectKey, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(ref response) if response.code == 409 => {
            Error::ApplyConflict(key.to_string())
        }
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_owned(&self, namespace: &str, selector: &str) -> Result<Vec<LiveObject>> {
        let params = ListParams::default().labels(selector);
        let mut live = Vec::new();
        for resource in &self.resources {
            let list = self.api(namespace, resource).list(&params).await?;
            for object in list.items {
                live.push(LiveObject::from_dynamic(
                    &resource.kind,
                    &typed(object, resource),
                )?);
            }
        }
        debug!(namespace, selector, count = live.len(), "Listed live objects");
        Ok(live)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>> {
        let resource = self.resource(&key.kind)?;
        match self.api(&key.namespace, resource).get_opt(&key.name).await? {
            Some(object) => Ok(Some(LiveObject::from_dynamic(
                &key.kind,
                &typed(object, resource),
            )?)),
            None => Ok(None),
        }
    }

    async fn create(&self, desired: &DesiredObject) -> Result<LiveObject> {
        let resource = self.resource(&desired.key.kind)?;
        let object: DynamicObject = serde_json::from_value(desired.payload.clone())?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = self
            .api(&desired.key.namespace, resource)
            .create(&params, &object)
            .await
            .map_err(|e| write_error(&desired.key, e))?;
        LiveObject::from_dynamic(&desired.key.kind, &typed(created, resource))
    }

    async fn patch(
        &self,
        desired: &DesiredObject,
        resource_version: Option<String>,
    ) -> Result<LiveObject> {
        let resource = self.resource(&desired.key.kind)?;
        let mut payload = desired.payload.clone();
        if let (Some(version), Some(metadata)) = (
            resource_version,
            payload.get_mut("metadata").and_then(|m| m.as_object_mut()),
        ) {
            metadata.insert("resourceVersion".into(), version.into());
        }

        let patched = self
            .api(&desired.key.namespace, resource)
            .patch(
                &desired.key.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&payload),
            )
            .await
            .map_err(|e| write_error(&desired.key, e))?;
        LiveObject::from_dynamic(&desired.key.kind, &typed(patched, resource))
    }

    async fn delete(&self, live: &LiveObject) -> Result<()> {
        let resource = self.resource(&live.key.kind)?;
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: live.resource_version.clone(),
                uid: None,
            }),
            ..Default::default()
        };
        self.api(&live.key.namespace, resource)
            .delete(&live.key.name, &params)
            .await
            .map_err(|e| write_error(&live.key, e))?;
        Ok(())
    }
}
