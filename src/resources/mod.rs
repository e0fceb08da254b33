pub mod common;
pub mod desired;
pub mod patroni;
pub mod pdb;
pub mod registry;
pub mod service;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, cluster_labels, owner_reference, patroni_labels,
    standard_labels,
};
pub use desired::{DesiredObject, LiveObject, ObjectKey};
pub use registry::{FactoryKind, FactoryRegistry, GenerationContext};
