//! Rolling restart of a cluster's instances
//!
//! `plan` builds the restart plan, `orchestrator` turns it into a sequential
//! stream of steps, and `handler` persists each step through the phase
//! state machine.

pub mod handler;
pub mod instance;
pub mod kube_ops;
pub mod orchestrator;
pub mod plan;
pub mod state_machine;

pub use handler::RestartHandler;
pub use instance::{Instance, InstanceRole, RestartReason, RestartReasons};
pub use kube_ops::KubeInstanceOps;
pub use orchestrator::{InstanceOps, RestartOrchestrator, RestartStep, next_step};
pub use plan::{ClusterRestartState, RestartEvent, build_plan};
pub use state_machine::{RestartPhaseEvent, RestartStateMachine, TransitionContext, TransitionResult};
