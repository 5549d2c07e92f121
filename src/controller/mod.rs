pub mod commands;
pub mod condition;
pub mod context;
pub mod enforcer;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod switchover;
pub mod validation;

pub use condition::{ConditionReporter, ConditionStatus, SwitchOutcome};
pub use context::Context;
pub use enforcer::{EnforcementPlan, EnforcementReport, StreamingEnforcer, StreamingSettings};
pub use error::{BackoffConfig, Error, Result};
pub use events::{KubeEventNotifier, TransitionEvent, TransitionKind, TransitionNotifier};
pub use reconciler::{error_policy, reconcile};
pub use state_machine::{SwitchEvent, SwitchStateMachine, TransitionContext};
pub use status::StatusManager;
pub use switchover::{PassInput, PassOutcome, SwitchoverPass};
pub use validation::{MAX_INSTANCES, MIN_INSTANCES, validate_spec};
