pub mod client;
pub mod comparator;
pub mod context;
pub mod dbops_reconciler;
pub mod error;
pub mod events;
pub mod lock;
pub mod reconciler;
pub mod restart;
pub mod status;
pub mod validation;

pub use client::{ClusterApi, KubeClusterApi};
pub use comparator::ComparatorSet;
pub use context::{Context, RetryCounter};
pub use dbops_reconciler::{dbops_error_policy, reconcile_dbops};
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use lock::KeyedLock;
pub use reconciler::{ReconcilePlan, ReconcileReport, ResourceReconciler, error_policy, reconcile};
pub use status::{ConditionBuilder, KubeStatusStore, StatusManager, StatusStore};
pub use validation::{MAX_INSTANCES, MIN_INSTANCES, validate_spec};
