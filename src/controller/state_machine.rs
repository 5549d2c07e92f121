//! Formal finite state machine for replica cluster switchover
//!
//! The transition table lists every legal phase change together with the
//! event that triggers it. Guards check the pass context before a transition
//! is allowed, so an illegal sequence (for example abandoning an in-flight
//! promotion because intent flipped back) is rejected instead of applied.

use std::fmt;

use crate::crd::SwitchPhase;
use crate::topology::RoleIntent;

/// Events that trigger switchover phase transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchEvent {
    /// Intent flipped to Primary while acting as a replica
    PromotionRequested,
    /// The designated primary left recovery and is the write leader
    PromotionCompleted,
    /// Intent flipped to Replica while acting as a primary
    DemotionRequested,
    /// The primary is in recovery and streams from the external source
    DemotionCompleted,
    /// Reconfiguration attempts or drift passes exceeded their budget
    RetryBudgetExhausted,
    /// The selector found no healthy instance
    NoEligiblePrimary,
    /// Health recovered after failing mid-promotion
    PromotionResumed,
    /// Health recovered after failing mid-demotion
    DemotionResumed,
    /// Health recovered after failing while acting as a replica
    ReplicaRestored,
    /// Health recovered after failing while acting as a primary
    PrimaryRestored,
}

impl fmt::Display for SwitchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchEvent::PromotionRequested => write!(f, "PromotionRequested"),
            SwitchEvent::PromotionCompleted => write!(f, "PromotionCompleted"),
            SwitchEvent::DemotionRequested => write!(f, "DemotionRequested"),
            SwitchEvent::DemotionCompleted => write!(f, "DemotionCompleted"),
            SwitchEvent::RetryBudgetExhausted => write!(f, "RetryBudgetExhausted"),
            SwitchEvent::NoEligiblePrimary => write!(f, "NoEligiblePrimary"),
            SwitchEvent::PromotionResumed => write!(f, "PromotionResumed"),
            SwitchEvent::DemotionResumed => write!(f, "DemotionResumed"),
            SwitchEvent::ReplicaRestored => write!(f, "ReplicaRestored"),
            SwitchEvent::PrimaryRestored => write!(f, "PrimaryRestored"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Declared role of the cluster on this pass
    pub intent: RoleIntent,
    /// Phase the cluster was in when it entered `Failed`
    pub failed_during: Option<SwitchPhase>,
    /// Failed attempts in the current phase
    pub attempts: u32,
    pub max_attempts: u32,
    /// Consecutive passes that ended with drift nothing could repair
    pub drift_passes: u32,
    pub drift_budget: u32,
    /// Whether the selector produced a designated primary on this pass
    pub primary_eligible: bool,
}

impl TransitionContext {
    pub fn new(intent: RoleIntent) -> Self {
        Self {
            intent,
            failed_during: None,
            attempts: 0,
            max_attempts: 5,
            drift_passes: 0,
            drift_budget: 3,
            primary_eligible: true,
        }
    }

    /// Check if either retry budget has been used up
    pub fn budget_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts || self.drift_passes >= self.drift_budget
    }
}

/// A state transition definition with optional guard
#[derive(Debug)]
pub struct Transition {
    pub from: SwitchPhase,
    pub to: SwitchPhase,
    pub event: SwitchEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: SwitchPhase,
        to: SwitchPhase,
        event: SwitchEvent,
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
    /// Transition was successful
    Success {
        from: SwitchPhase,
        to: SwitchPhase,
        event: SwitchEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: SwitchPhase,
        event: SwitchEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: SwitchPhase,
        to: SwitchPhase,
        event: SwitchEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase of a successful transition
    pub fn target(&self) -> Option<SwitchPhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Formal state machine for replica cluster switchover
pub struct SwitchStateMachine {
    transitions: Vec<Transition>,
}

impl Default for SwitchStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === SteadyReplica ===
                Transition::new(
                    SwitchPhase::SteadyReplica,
                    SwitchPhase::PromotingToPrimary,
                    SwitchEvent::PromotionRequested,
                    "Intent flipped to primary, promoting designated primary",
                ),
                Transition::new(
                    SwitchPhase::SteadyReplica,
                    SwitchPhase::Failed,
                    SwitchEvent::NoEligiblePrimary,
                    "No healthy instance can follow the external source",
                ),
                Transition::new(
                    SwitchPhase::SteadyReplica,
                    SwitchPhase::Failed,
                    SwitchEvent::RetryBudgetExhausted,
                    "Streaming topology did not converge",
                ),
                // === PromotingToPrimary ===
                Transition::new(
                    SwitchPhase::PromotingToPrimary,
                    SwitchPhase::SteadyPrimary,
                    SwitchEvent::PromotionCompleted,
                    "Designated primary promoted to write leader",
                ),
                Transition::new(
                    SwitchPhase::PromotingToPrimary,
                    SwitchPhase::Failed,
                    SwitchEvent::NoEligiblePrimary,
                    "No healthy instance to promote",
                ),
                Transition::new(
                    SwitchPhase::PromotingToPrimary,
                    SwitchPhase::Failed,
                    SwitchEvent::RetryBudgetExhausted,
                    "Promotion did not take effect",
                ),
                // === SteadyPrimary ===
                Transition::new(
                    SwitchPhase::SteadyPrimary,
                    SwitchPhase::DemotingToReplica,
                    SwitchEvent::DemotionRequested,
                    "Intent flipped to replica, demoting primary",
                ),
                Transition::new(
                    SwitchPhase::SteadyPrimary,
                    SwitchPhase::Failed,
                    SwitchEvent::NoEligiblePrimary,
                    "No healthy instance can act as write leader",
                ),
                Transition::new(
                    SwitchPhase::SteadyPrimary,
                    SwitchPhase::Failed,
                    SwitchEvent::RetryBudgetExhausted,
                    "Streaming topology did not converge",
                ),
                // === DemotingToReplica ===
                Transition::new(
                    SwitchPhase::DemotingToReplica,
                    SwitchPhase::SteadyReplica,
                    SwitchEvent::DemotionCompleted,
                    "Primary demoted and streaming from external source",
                ),
                Transition::new(
                    SwitchPhase::DemotingToReplica,
                    SwitchPhase::Failed,
                    SwitchEvent::NoEligiblePrimary,
                    "No healthy instance to demote",
                ),
                Transition::new(
                    SwitchPhase::DemotingToReplica,
                    SwitchPhase::Failed,
                    SwitchEvent::RetryBudgetExhausted,
                    "Demotion did not take effect",
                ),
                // === Failed (retry checkpoint, not terminal) ===
                Transition::new(
                    SwitchPhase::Failed,
                    SwitchPhase::PromotingToPrimary,
                    SwitchEvent::PromotionResumed,
                    "Resuming interrupted promotion",
                ),
                Transition::new(
                    SwitchPhase::Failed,
                    SwitchPhase::DemotingToReplica,
                    SwitchEvent::DemotionResumed,
                    "Resuming interrupted demotion",
                ),
                Transition::new(
                    SwitchPhase::Failed,
                    SwitchPhase::SteadyReplica,
                    SwitchEvent::ReplicaRestored,
                    "Replica cluster recovered",
                ),
                Transition::new(
                    SwitchPhase::Failed,
                    SwitchPhase::SteadyPrimary,
                    SwitchEvent::PrimaryRestored,
                    "Primary cluster recovered",
                ),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &SwitchPhase,
        event: SwitchEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &SwitchPhase, event: &SwitchEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &SwitchPhase) -> Vec<&SwitchEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.to, &transition.event) {
            (_, SwitchEvent::PromotionRequested) if ctx.intent != RoleIntent::Primary => {
                Some(format!("Intent is {}, not Primary", ctx.intent))
            }
            (_, SwitchEvent::DemotionRequested) if ctx.intent != RoleIntent::Replica => {
                Some(format!("Intent is {}, not Replica", ctx.intent))
            }
            (_, SwitchEvent::RetryBudgetExhausted) if !ctx.budget_exhausted() => Some(format!(
                "Budget remaining: {}/{} attempts, {}/{} drift passes",
                ctx.attempts, ctx.max_attempts, ctx.drift_passes, ctx.drift_budget
            )),
            (_, SwitchEvent::NoEligiblePrimary) if ctx.primary_eligible => {
                Some("A designated primary is available".to_string())
            }
            // Leaving Failed requires a healthy candidate and must return to
            // the phase that failed
            (to, event) if transition.from == SwitchPhase::Failed => {
                let expected = resume_phase(ctx);
                if !ctx.primary_eligible {
                    Some(format!("Cannot {}: no eligible primary", event))
                } else if expected != *to {
                    Some(format!("Must resume {}, not {}", expected, to))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Phase of a cluster seen for the first time
pub fn initial_phase(intent: RoleIntent) -> SwitchPhase {
    match intent {
        RoleIntent::Replica => SwitchPhase::SteadyReplica,
        RoleIntent::Primary => SwitchPhase::SteadyPrimary,
    }
}

/// Determine the event the current pass should raise, if any
///
/// In-flight transitions produce no intent-driven event: they run to
/// completion and the newer intent is evaluated once they are steady.
pub fn determine_event(current_phase: &SwitchPhase, ctx: &TransitionContext) -> Option<SwitchEvent> {
    if !ctx.primary_eligible && *current_phase != SwitchPhase::Failed {
        return Some(SwitchEvent::NoEligiblePrimary);
    }

    match current_phase {
        SwitchPhase::SteadyReplica if ctx.intent == RoleIntent::Primary => {
            Some(SwitchEvent::PromotionRequested)
        }
        SwitchPhase::SteadyPrimary if ctx.intent == RoleIntent::Replica => {
            Some(SwitchEvent::DemotionRequested)
        }
        SwitchPhase::Failed if ctx.primary_eligible => Some(match resume_phase(ctx) {
            SwitchPhase::PromotingToPrimary => SwitchEvent::PromotionResumed,
            SwitchPhase::DemotingToReplica => SwitchEvent::DemotionResumed,
            SwitchPhase::SteadyPrimary => SwitchEvent::PrimaryRestored,
            SwitchPhase::SteadyReplica | SwitchPhase::Failed => SwitchEvent::ReplicaRestored,
        }),
        _ => None,
    }
}

/// Phase a failed cluster returns to
///
/// Without a recorded origin the phase matching intent is used.
fn resume_phase(ctx: &TransitionContext) -> SwitchPhase {
    match ctx.failed_during {
        Some(phase) if phase != SwitchPhase::Failed => phase,
        _ => initial_phase(ctx.intent),
    }
}
