use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::client::{ClusterApi, KubeClusterApi};
use crate::controller::comparator::ComparatorSet;
use crate::controller::error::Result;
use crate::controller::events::{EventPublisher, KubeEventPublisher};
use crate::controller::lock::KeyedLock;
use crate::controller::restart::{InstanceOps, KubeInstanceOps};
use crate::controller::status::{KubeStatusStore, StatusStore};
use crate::health::{HealthState, Metrics};
use crate::resources::FactoryRegistry;

/// Consecutive failed passes per key, driving the requeue backoff
#[derive(Debug, Clone, Default)]
pub struct RetryCounter {
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl RetryCounter {
    /// Count a failure and return how many preceded it
    pub fn next_attempt(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = attempts.entry(key.to_string()).or_insert(0);
        let attempt = *entry;
        *entry = entry.saturating_add(1);
        attempt
    }

    pub fn reset(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }
}

/// Shared context for both controllers
///
/// Every collaborator that talks to the API server sits behind a trait so the
/// reconcilers can run against in-memory fakes.
#[derive(Clone)]
pub struct Context {
    pub config: OperatorConfig,
    pub registry: Arc<FactoryRegistry>,
    pub comparators: Arc<ComparatorSet>,
    /// Serializes passes per cluster and restarts per cluster
    pub locks: KeyedLock,
    pub retries: RetryCounter,
    pub api: Arc<dyn ClusterApi>,
    pub status_store: Arc<dyn StatusStore>,
    pub instance_ops: Arc<dyn InstanceOps>,
    pub events: Arc<dyn EventPublisher>,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Result<Self> {
        let instance_ops = KubeInstanceOps::new(
            client.clone(),
            config.restart_ready_timeout,
            config.restart_poll_interval,
        )?;
        let events = KubeEventPublisher::new(client.clone(), Some(config.pod_name.clone()));

        Ok(Self {
            registry: Arc::new(FactoryRegistry::standard()),
            comparators: Arc::new(ComparatorSet::standard()?),
            locks: KeyedLock::new(),
            retries: RetryCounter::default(),
            api: Arc::new(KubeClusterApi::new(client.clone())),
            status_store: Arc::new(KubeStatusStore::new(client)),
            instance_ops: Arc::new(instance_ops),
            events: Arc::new(events),
            health_state,
            config,
        })
    }

    /// Assemble a context from explicit collaborators
    pub fn from_parts(
        config: OperatorConfig,
        api: Arc<dyn ClusterApi>,
        status_store: Arc<dyn StatusStore>,
        instance_ops: Arc<dyn InstanceOps>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            registry: Arc::new(FactoryRegistry::standard()),
            comparators: Arc::new(ComparatorSet::standard()?),
            locks: KeyedLock::new(),
            retries: RetryCounter::default(),
            api,
            status_store,
            instance_ops,
            events,
            health_state: None,
        })
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.health_state.as_ref().map(|h| &h.metrics)
    }
}
