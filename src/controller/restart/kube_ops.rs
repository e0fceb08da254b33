//! `InstanceOps` against pods and the Patroni REST API
//!
//! Pod restarts delete the pod and let the StatefulSet recreate it. PostgreSQL
//! restarts and switchovers go through Patroni on port 8008 of the pod IP.
//! Scaling patches the cluster resource, which the cluster controller turns
//! into a StatefulSet change. Every wait polls the pod until the instance is
//! ready or the timeout passes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::restart::instance::Instance;
use crate::controller::restart::orchestrator::InstanceOps;
use crate::crd::PostgresCluster;
use crate::resources::common::{PATRONI_PORT, instance_selector};

/// Timeout of a single Patroni REST call
const PATRONI_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KubeInstanceOps {
    client: Client,
    http: reqwest::Client,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl KubeInstanceOps {
    pub fn new(client: Client, ready_timeout: Duration, poll_interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PATRONI_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            http,
            ready_timeout,
            poll_interval,
        })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patroni_url(&self, namespace: &str, instance: &str, path: &str) -> Result<String> {
        let pod = self
            .pods(namespace)
            .get_opt(instance)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Pod {}/{}", namespace, instance)))?;
        let ip = pod
            .status
            .and_then(|s| s.pod_ip)
            .ok_or_else(|| Error::NotFound(format!("IP of pod {}/{}", namespace, instance)))?;
        Ok(format!("http://{}:{}{}", ip, PATRONI_PORT, path))
    }

    /// Poll `check` until it returns true or the readiness timeout passes
    async fn poll_until<F, Fut>(&self, instance: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<bool>> + Send,
    {
        let wait = async {
            loop {
                if check().await? {
                    return Ok(());
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(self.ready_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadinessTimeout {
                instance: instance.to_string(),
                timeout: self.ready_timeout,
            }),
        }
    }

    /// Wait until the pod named `instance` is ready, optionally with a new uid
    async fn wait_for_pod(
        &self,
        namespace: &str,
        instance: &str,
        replaced_uid: Option<String>,
    ) -> Result<()> {
        let pods = self.pods(namespace);
        self.poll_until(instance, || {
            let pods = pods.clone();
            let replaced_uid = replaced_uid.clone();
            async move {
                let Some(pod) = pods.get_opt(instance).await? else {
                    return Ok(false);
                };
                let replaced = replaced_uid.is_none_or(|old| pod.uid() != Some(old));
                Ok(replaced && Instance::from_pod(&pod).is_some_and(|i| i.ready))
            }
        })
        .await
    }
}

#[async_trait]
impl InstanceOps for KubeInstanceOps {
    async fn list_instances(&self, namespace: &str, cluster: &str) -> Result<Vec<Instance>> {
        let params = ListParams::default().labels(&instance_selector(cluster));
        let pods = self.pods(namespace).list(&params).await?;
        Ok(pods.items.iter().filter_map(Instance::from_pod).collect())
    }

    async fn restart_pod(&self, namespace: &str, instance: &str) -> Result<()> {
        let pods = self.pods(namespace);
        let uid = pods.get_opt(instance).await?.and_then(|p| p.uid());

        info!(namespace, instance, "Deleting pod");
        match pods.delete(instance, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(namespace, instance, "Pod already gone");
            }
            Err(e) => return Err(e.into()),
        }

        self.wait_for_pod(namespace, instance, uid).await
    }

    async fn wait_ready(&self, namespace: &str, instance: &str) -> Result<()> {
        self.wait_for_pod(namespace, instance, None).await
    }

    async fn restart_postgres(&self, namespace: &str, instance: &str) -> Result<()> {
        let url = self.patroni_url(namespace, instance, "/restart").await?;
        info!(namespace, instance, "Restarting PostgreSQL through Patroni");
        let response = self.http.post(&url).json(&json!({})).send().await?;
        if !response.status().is_success() {
            let code = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RestartRejected(format!(
                "{}: {} {}",
                instance,
                code,
                body.trim()
            )));
        }

        self.wait_for_pod(namespace, instance, None).await
    }

    async fn switchover(
        &self,
        namespace: &str,
        cluster: &str,
        primary: &str,
        candidate: &str,
    ) -> Result<()> {
        let url = self.patroni_url(namespace, primary, "/switchover").await?;
        info!(namespace, cluster, primary, candidate, "Requesting switchover");

        let response = self
            .http
            .post(&url)
            .json(&json!({ "leader": primary, "candidate": candidate }))
            .send()
            .await?;
        if !response.status().is_success() {
            let code = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SwitchoverRejected(format!(
                "{} -> {}: {} {}",
                primary,
                candidate,
                code,
                body.trim()
            )));
        }

        let pods = self.pods(namespace);
        self.poll_until(candidate, || {
            let pods = pods.clone();
            async move {
                Ok(pods
                    .get_opt(candidate)
                    .await?
                    .and_then(|p| Instance::from_pod(&p))
                    .is_some_and(|i| i.is_primary()))
            }
        })
        .await
    }

    async fn scale_instances(&self, namespace: &str, cluster: &str, instances: i32) -> Result<()> {
        let clusters: Api<PostgresCluster> = Api::namespaced(self.client.clone(), namespace);
        info!(namespace, cluster, instances, "Scaling cluster");
        clusters
            .patch(
                cluster,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "instances": instances } })),
            )
            .await?;
        Ok(())
    }
}
