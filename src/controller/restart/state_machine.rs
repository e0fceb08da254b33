//! Finite state machine for the rolling restart of a cluster
//!
//! Every persisted phase change goes through this table, so an event that
//! would restart the primary early, or complete with work left, is rejected
//! before it reaches the status.

use std::fmt;

use crate::controller::restart::plan::{ClusterRestartState, RestartEvent};
use crate::crd::RestartPhase;

/// Events that trigger restart phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartPhaseEvent {
    /// The plan was written to the operation and cluster status
    PlanInitialized,
    /// A replica finished restarting
    ReplicaRestarted,
    /// A pod that appeared during the run became ready
    InstanceAdopted,
    /// Leadership moved away from the planned primary
    SwitchoverInitiated,
    /// The planned primary finished restarting
    PrimaryRestarted,
    /// No instance needs a restart any more
    AllRestarted,
    /// A step failed and cannot be retried in place
    StepFailed,
    /// A failed operation is resumed from its persisted plan
    RetryRequested,
}

impl fmt::Display for RestartPhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPhaseEvent::PlanInitialized => write!(f, "PlanInitialized"),
            RestartPhaseEvent::ReplicaRestarted => write!(f, "ReplicaRestarted"),
            RestartPhaseEvent::InstanceAdopted => write!(f, "InstanceAdopted"),
            RestartPhaseEvent::SwitchoverInitiated => write!(f, "SwitchoverInitiated"),
            RestartPhaseEvent::PrimaryRestarted => write!(f, "PrimaryRestarted"),
            RestartPhaseEvent::AllRestarted => write!(f, "AllRestarted"),
            RestartPhaseEvent::StepFailed => write!(f, "StepFailed"),
            RestartPhaseEvent::RetryRequested => write!(f, "RetryRequested"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Replicas with a restart reason that are not restarted yet
    pub pending_replicas: usize,
    /// The planned primary has a reason and is not restarted yet
    pub primary_pending: bool,
    pub switchover_initiated: bool,
    pub has_switchover_candidate: bool,
    pub op_retries: i32,
    pub max_retries: i32,
}

impl TransitionContext {
    /// Context describing the plan before an event is applied
    pub fn for_plan(state: &ClusterRestartState) -> Self {
        Self {
            pending_replicas: state.pending_replicas().len(),
            primary_pending: state.primary_needs_restart(),
            switchover_initiated: state.switchover_initiated,
            has_switchover_candidate: state.has_switchover_candidate(),
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, op_retries: i32, max_retries: i32) -> Self {
        self.op_retries = op_retries;
        self.max_retries = max_retries;
        self
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: RestartPhase,
    pub to: RestartPhase,
    pub event: RestartPhaseEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: RestartPhase,
        to: RestartPhase,
        event: RestartPhaseEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: RestartPhase,
        to: RestartPhase,
        event: RestartPhaseEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: RestartPhase,
        event: RestartPhaseEvent,
    },
    GuardFailed {
        from: RestartPhase,
        to: RestartPhase,
        event: RestartPhaseEvent,
        reason: String,
    },
}

pub struct RestartStateMachine {
    transitions: Vec<Transition>,
}

impl Default for RestartStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartStateMachine {
    pub fn new() -> Self {
        use RestartPhase::*;
        use RestartPhaseEvent::*;

        let mut transitions = vec![
            Transition::new(
                NotStarted,
                Initialized,
                PlanInitialized,
                "Restart plan persisted",
            ),
            // === Replicas ===
            Transition::new(
                Initialized,
                RestartingReplicas,
                ReplicaRestarted,
                "First replica restarted",
            ),
            Transition::new(
                RestartingReplicas,
                RestartingReplicas,
                ReplicaRestarted,
                "Replica restarted",
            ),
            Transition::new(
                Initialized,
                RestartingReplicas,
                InstanceAdopted,
                "New instance adopted",
            ),
            Transition::new(
                RestartingReplicas,
                RestartingReplicas,
                InstanceAdopted,
                "New instance adopted",
            ),
            Transition::new(
                SwitchoverPending,
                SwitchoverPending,
                InstanceAdopted,
                "New instance adopted after switchover",
            ),
            Transition::new(
                RestartingPrimary,
                RestartingPrimary,
                InstanceAdopted,
                "New instance adopted after primary restart",
            ),
            // === Switchover ===
            Transition::new(
                Initialized,
                SwitchoverPending,
                SwitchoverInitiated,
                "Switchover with no replica to restart",
            ),
            Transition::new(
                RestartingReplicas,
                SwitchoverPending,
                SwitchoverInitiated,
                "Replicas restarted, switching over",
            ),
            // === Primary ===
            Transition::new(
                SwitchoverPending,
                RestartingPrimary,
                PrimaryRestarted,
                "Former primary restarted",
            ),
            Transition::new(
                Initialized,
                RestartingPrimary,
                PrimaryRestarted,
                "Single instance restarted",
            ),
            Transition::new(
                RestartingReplicas,
                RestartingPrimary,
                PrimaryRestarted,
                "Single instance restarted after adoption",
            ),
            // === Completion ===
            Transition::new(
                Initialized,
                Completed,
                AllRestarted,
                "Nothing to restart",
            ),
            Transition::new(
                RestartingReplicas,
                Completed,
                AllRestarted,
                "Replicas restarted, primary unchanged",
            ),
            Transition::new(
                SwitchoverPending,
                Completed,
                AllRestarted,
                "Switchover done, primary unchanged",
            ),
            Transition::new(
                RestartingPrimary,
                Completed,
                AllRestarted,
                "Every instance restarted",
            ),
            // === Retry ===
            Transition::new(
                Failed,
                Initialized,
                RetryRequested,
                "Retrying from the persisted plan",
            ),
        ];

        for from in [
            NotStarted,
            Initialized,
            RestartingReplicas,
            SwitchoverPending,
            RestartingPrimary,
        ] {
            transitions.push(Transition::new(from, Failed, StepFailed, "Restart failed"));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &RestartPhase,
        event: RestartPhaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &RestartPhase, event: &RestartPhaseEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    pub fn valid_events(&self, state: &RestartPhase) -> Vec<&RestartPhaseEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.from, &transition.event) {
            // Primary-last: every replica with a reason goes first
            (_, RestartPhaseEvent::SwitchoverInitiated) if ctx.pending_replicas > 0 => Some(
                format!("{} replicas still need a restart", ctx.pending_replicas),
            ),
            (RestartPhase::SwitchoverPending, RestartPhaseEvent::PrimaryRestarted)
                if !ctx.switchover_initiated =>
            {
                Some("switchover has not been initiated".to_string())
            }
            (_, RestartPhaseEvent::PrimaryRestarted) if ctx.pending_replicas > 0 => Some(
                format!("{} replicas still need a restart", ctx.pending_replicas),
            ),
            (
                RestartPhase::Initialized | RestartPhase::RestartingReplicas,
                RestartPhaseEvent::PrimaryRestarted,
            ) if ctx.has_switchover_candidate => {
                Some("primary must be switched over before its restart".to_string())
            }
            (_, RestartPhaseEvent::AllRestarted)
                if ctx.pending_replicas > 0 || ctx.primary_pending =>
            {
                Some("instances still need a restart".to_string())
            }
            (_, RestartPhaseEvent::RetryRequested) if ctx.op_retries >= ctx.max_retries => {
                Some(format!(
                    "retry limit reached: {}/{}",
                    ctx.op_retries, ctx.max_retries
                ))
            }
            _ => None,
        }
    }
}

/// Classify a restart step for the state machine
pub fn event_for(state: &ClusterRestartState, event: &RestartEvent) -> RestartPhaseEvent {
    match event {
        RestartEvent::Switchover { .. } => RestartPhaseEvent::SwitchoverInitiated,
        RestartEvent::PodCreated(name) if !state.total_instances.contains(name) => {
            RestartPhaseEvent::InstanceAdopted
        }
        other if other.instance() == state.primary_instance => RestartPhaseEvent::PrimaryRestarted,
        _ => RestartPhaseEvent::ReplicaRestarted,
    }
}
