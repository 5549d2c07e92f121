//! One level-triggered switchover pass
//!
//! A pass starts from the persisted `SwitchStatus` and freshly observed
//! instance state, raises at most one intent-driven event, executes the
//! actions of the resulting phase and returns the new record together with
//! the condition outcome. Nothing is kept in memory between passes.
//!
//! Order of a pass:
//! 1. Derive the initial phase for a cluster seen for the first time
//! 2. Reject external source changes outside `SteadyReplica`
//! 3. Designate the primary according to the phase being acted out
//! 4. Raise and apply the state machine event
//! 5. Promote, demote or enforce streaming depending on the phase
//!
//! Only a steady replica cluster re-elects its designated primary. A primary
//! cluster keeps its write leader, and an in-flight transition acts on the
//! instance pinned in `SwitchStatus::target` when it started.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::controller::commands::{Command, CommandRunner};
use crate::controller::condition::{SwitchOutcome, timestamp};
use crate::controller::enforcer::{EnforcementPlan, StreamingEnforcer, StreamingSettings};
use crate::controller::error::{Error, Result};
use crate::controller::events::{TransitionEvent, TransitionKind};
use crate::controller::state_machine::{
    SwitchEvent, SwitchStateMachine, TransitionContext, TransitionResult, determine_event,
    initial_phase,
};
use crate::crd::{SwitchPhase, SwitchStatus};
use crate::resources::instance::InstanceCommander;
use crate::topology::{
    ClusterTopology, ExternalSource, InstanceId, ObservedHealth, ObservedReplication, RoleIntent,
    elect_primary,
};

/// Everything a pass reads
#[derive(Debug, Clone)]
pub struct PassInput {
    pub topology: ClusterTopology,
    /// Persisted switch record, `None` on first observation
    pub previous: Option<SwitchStatus>,
    pub observations: BTreeMap<InstanceId, ObservedReplication>,
    pub health: ObservedHealth,
    /// External clusters declared on the resource, by name
    pub sources: BTreeMap<String, ExternalSource>,
    pub now: DateTime<Utc>,
}

impl PassInput {
    pub fn new(topology: ClusterTopology, previous: Option<SwitchStatus>, now: DateTime<Utc>) -> Self {
        let sources = topology
            .external_source()
            .map(|s| (s.name().to_string(), s.clone()))
            .into_iter()
            .collect();
        Self {
            topology,
            previous,
            observations: BTreeMap::new(),
            health: ObservedHealth::new(),
            sources,
            now,
        }
    }

    /// Record a successful observation; observed instances count as healthy
    pub fn observe(&mut self, id: InstanceId, observed: ObservedReplication) {
        self.health.mark_healthy(id.clone());
        self.observations.insert(id, observed);
    }
}

/// Everything a pass produces
#[derive(Debug)]
pub struct PassOutcome {
    pub record: SwitchStatus,
    pub topology: ClusterTopology,
    pub outcome: SwitchOutcome,
    pub requeue_after: Duration,
    pub events: Vec<TransitionEvent>,
    pub commands_issued: usize,
    /// Drift found before enforcement
    pub drift: usize,
    /// Failure surfaced by this pass
    pub error: Option<Error>,
}

/// Executes switchover passes for one cluster
pub struct SwitchoverPass<'a, C> {
    commander: &'a C,
    settings: &'a StreamingSettings,
    config: &'a OperatorConfig,
    machine: SwitchStateMachine,
}

/// Mutable state threaded through a single pass
struct PassState {
    record: SwitchStatus,
    topology: ClusterTopology,
    events: Vec<TransitionEvent>,
    drift: usize,
    now: DateTime<Utc>,
}

impl PassState {
    fn new(record: SwitchStatus, topology: ClusterTopology, now: DateTime<Utc>) -> Self {
        Self {
            record,
            topology,
            events: Vec::new(),
            drift: 0,
            now,
        }
    }
}

/// What the phase action concluded
struct Step {
    outcome: SwitchOutcome,
    requeue_after: Duration,
    error: Option<Error>,
}

impl<'a, C: InstanceCommander> SwitchoverPass<'a, C> {
    pub fn new(commander: &'a C, settings: &'a StreamingSettings, config: &'a OperatorConfig) -> Self {
        Self {
            commander,
            settings,
            config,
            machine: SwitchStateMachine::new(),
        }
    }

    pub async fn run(&self, input: PassInput) -> PassOutcome {
        let PassInput {
            mut topology,
            previous,
            observations,
            health,
            sources,
            now,
        } = input;
        let runner = CommandRunner::new(self.commander, &self.config.switchover);

        let mut record = previous.unwrap_or_else(|| {
            let phase = initial_phase(topology.intent());
            info!(cluster = %topology.name(), phase = %phase, "First observation of cluster");
            SwitchStatus {
                phase,
                source: topology.external_source().map(|s| s.name().to_string()),
                ..Default::default()
            }
        });

        if let Err(error) = accept_source_change(&mut record, &topology) {
            warn!(cluster = %topology.name(), error = %error, "Rejecting external source change");
            let state = PassState::new(record, topology, now);
            let step = Step {
                outcome: SwitchOutcome::failed(&error),
                requeue_after: self.config.error_backoff.max_delay,
                error: Some(error),
            };
            return self.finish(state, step, &runner);
        }

        let designation = designate_primary(&mut record, &mut topology, &observations, &health);
        let mut state = PassState::new(record, topology, now);

        let ctx = self.context(&state, designation.is_ok());
        if let Some(event) = determine_event(&state.record.phase, &ctx) {
            self.fire(&mut state, event, &ctx);
        }

        let step = match state.record.phase {
            SwitchPhase::Failed => {
                let error = match designation {
                    Err(e) => e,
                    Ok(()) => Error::TransientError("waiting to resume from Failed".to_string()),
                };
                state.record.attempts = state.record.attempts.saturating_add(1);
                Step {
                    outcome: SwitchOutcome::failed(&error),
                    requeue_after: self.config.error_backoff.delay_for_attempt(state.record.attempts),
                    error: Some(error),
                }
            }
            SwitchPhase::PromotingToPrimary => self.promote(&mut state, &runner, &observations).await,
            SwitchPhase::DemotingToReplica => {
                self.demote(&mut state, &runner, &observations, &sources).await
            }
            SwitchPhase::SteadyReplica | SwitchPhase::SteadyPrimary => {
                self.steady(&mut state, &runner, &observations).await
            }
        };

        self.finish(state, step, &runner)
    }

    fn finish(&self, state: PassState, step: Step, runner: &CommandRunner<'_, C>) -> PassOutcome {
        PassOutcome {
            record: state.record,
            topology: state.topology,
            outcome: step.outcome,
            requeue_after: step.requeue_after,
            events: state.events,
            commands_issued: runner.issued(),
            drift: state.drift,
            error: step.error,
        }
    }

    fn context(&self, state: &PassState, primary_eligible: bool) -> TransitionContext {
        TransitionContext {
            intent: state.topology.intent(),
            failed_during: state.record.failed_during,
            attempts: state.record.attempts,
            max_attempts: self.config.switchover.max_attempts,
            drift_passes: state.record.drift_passes,
            drift_budget: self.config.switchover.drift_budget,
            primary_eligible,
        }
    }

    /// Apply an event to the record; returns whether the phase changed
    fn fire(&self, state: &mut PassState, event: SwitchEvent, ctx: &TransitionContext) -> bool {
        let cluster = state.topology.name().to_string();
        match self.machine.transition(&state.record.phase, event, ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                info!(cluster = %cluster, from = %from, to = %to, event = %event, "{}", description);
                let now = state.now;
                let record = &mut state.record;
                if to == SwitchPhase::Failed {
                    record.failed_during = Some(from);
                } else if from == SwitchPhase::Failed {
                    record.failed_during = None;
                    record.attempts = 0;
                    record.drift_passes = 0;
                }
                if to.is_transitioning() {
                    // A resumed transition keeps its original start time
                    if is_steady(from) {
                        record.attempts = 0;
                        record.transition_started_at = Some(timestamp(now));
                    } else if record.transition_started_at.is_none() {
                        record.transition_started_at = Some(timestamp(now));
                    }
                } else if to != SwitchPhase::Failed {
                    record.transition_started_at = None;
                    record.target = None;
                }
                if matches!(
                    event,
                    SwitchEvent::PromotionRequested | SwitchEvent::DemotionRequested
                ) {
                    record.target = state.topology.current_primary().map(|p| p.to_string());
                }
                if event == SwitchEvent::DemotionRequested {
                    record.source = state
                        .topology
                        .external_source()
                        .map(|s| s.name().to_string());
                }
                record.phase = to;
                true
            }
            TransitionResult::GuardFailed { reason, .. } => {
                debug!(cluster = %cluster, event = %event, reason = %reason, "Transition guard failed");
                false
            }
            TransitionResult::InvalidTransition { current, .. } => {
                debug!(cluster = %cluster, event = %event, phase = %current, "No transition for event");
                false
            }
        }
    }

    /// Count a failed attempt; enter `Failed` once the budget is spent
    fn retry_or_fail(&self, state: &mut PassState, error: Error, in_progress: SwitchOutcome) -> Step {
        state.record.attempts = state.record.attempts.saturating_add(1);
        let ctx = self.context(state, true);
        if self.fire(state, SwitchEvent::RetryBudgetExhausted, &ctx) {
            warn!(
                cluster = %state.topology.name(),
                attempts = state.record.attempts,
                error = %error,
                "Retry budget exhausted"
            );
            return Step {
                outcome: SwitchOutcome::failed(&error),
                requeue_after: self.config.error_backoff.delay_for_attempt(state.record.attempts),
                error: Some(error),
            };
        }

        Step {
            outcome: in_progress,
            requeue_after: self
                .config
                .error_backoff
                .delay_for_attempt(state.record.attempts - 1),
            error: Some(error),
        }
    }

    async fn promote(
        &self,
        state: &mut PassState,
        runner: &CommandRunner<'_, C>,
        observations: &BTreeMap<InstanceId, ObservedReplication>,
    ) -> Step {
        let (primary, observed) = match self.observed_target(state, observations) {
            Ok(target) => target,
            Err(error) => {
                let in_progress = SwitchOutcome::in_progress(
                    SwitchPhase::PromotingToPrimary,
                    format!("Waiting for promotion target: {}", error),
                );
                return self.retry_or_fail(state, error, in_progress);
            }
        };

        match promote_instance(runner, &primary, observed).await {
            Ok(()) => {
                let ctx = self.context(state, true);
                self.fire(state, SwitchEvent::PromotionCompleted, &ctx);
                state.record.source = None;
                state.record.attempts = 0;
                state.record.drift_passes = 0;
                state.events.push(TransitionEvent {
                    kind: TransitionKind::Promoted,
                    cluster: state.topology.name().to_string(),
                    instance: primary.to_string(),
                    at: state.now,
                });
                Step {
                    outcome: SwitchOutcome::steady(SwitchPhase::SteadyPrimary, Some(primary.as_str())),
                    requeue_after: self.config.transition_requeue,
                    error: None,
                }
            }
            Err(error) => {
                let in_progress = SwitchOutcome::in_progress(
                    SwitchPhase::PromotingToPrimary,
                    format!("Promoting {}: {}", primary, error),
                );
                self.retry_or_fail(state, error, in_progress)
            }
        }
    }

    async fn demote(
        &self,
        state: &mut PassState,
        runner: &CommandRunner<'_, C>,
        observations: &BTreeMap<InstanceId, ObservedReplication>,
        sources: &BTreeMap<String, ExternalSource>,
    ) -> Step {
        let source = state
            .record
            .source
            .as_deref()
            .and_then(|name| sources.get(name))
            .or_else(|| state.topology.external_source())
            .cloned();
        let Some(source) = source else {
            let error = Error::ConfigurationError(format!(
                "external source {} for demotion is not defined",
                state.record.source.as_deref().unwrap_or("<unset>")
            ));
            return Step {
                outcome: SwitchOutcome::failed(&error),
                requeue_after: self.config.error_backoff.max_delay,
                error: Some(error),
            };
        };

        let (primary, observed) = match self.observed_target(state, observations) {
            Ok(target) => target,
            Err(error) => {
                let in_progress = SwitchOutcome::in_progress(
                    SwitchPhase::DemotingToReplica,
                    format!("Waiting for demotion target: {}", error),
                );
                return self.retry_or_fail(state, error, in_progress);
            }
        };

        match demote_instance(runner, &primary, observed, &source).await {
            Ok(()) => {
                let ctx = self.context(state, true);
                self.fire(state, SwitchEvent::DemotionCompleted, &ctx);
                state.record.source = Some(source.name().to_string());
                state.record.attempts = 0;
                state.record.drift_passes = 0;
                state.events.push(TransitionEvent {
                    kind: TransitionKind::Demoted,
                    cluster: state.topology.name().to_string(),
                    instance: primary.to_string(),
                    at: state.now,
                });
                Step {
                    outcome: SwitchOutcome::steady(SwitchPhase::SteadyReplica, Some(primary.as_str())),
                    requeue_after: self.config.transition_requeue,
                    error: None,
                }
            }
            Err(error) => {
                let in_progress = SwitchOutcome::in_progress(
                    SwitchPhase::DemotingToReplica,
                    format!("Demoting {}: {}", primary, error),
                );
                self.retry_or_fail(state, error, in_progress)
            }
        }
    }

    async fn steady(
        &self,
        state: &mut PassState,
        runner: &CommandRunner<'_, C>,
        observations: &BTreeMap<InstanceId, ObservedReplication>,
    ) -> Step {
        let phase = state.record.phase;
        let primary = state.topology.current_primary().map(|p| p.to_string());
        let steady_outcome = SwitchOutcome::steady(phase, primary.as_deref());

        // Restored from Failed into a role that no longer matches intent; the
        // next pass starts the switch, so there is nothing to enforce
        let acting = match phase {
            SwitchPhase::SteadyPrimary => RoleIntent::Primary,
            _ => RoleIntent::Replica,
        };
        if state.topology.intent() != acting {
            return Step {
                outcome: steady_outcome,
                requeue_after: self.config.transition_requeue,
                error: None,
            };
        }

        let plan = EnforcementPlan::compute(&state.topology, observations, self.settings.addressing());
        state.drift = plan.drift.len();

        let enforcer = StreamingEnforcer::new(runner, self.settings);
        let mut report = enforcer.enforce(&state.topology, plan).await;

        if report.is_converged() {
            state.record.attempts = 0;
            state.record.drift_passes = 0;
            return Step {
                outcome: steady_outcome,
                requeue_after: self.config.steady_requeue,
                error: None,
            };
        }

        let remaining = report.remaining();
        if let Some((_, error)) = report.unconfirmed.pop() {
            return self.retry_or_fail(state, error, steady_outcome);
        }

        // Only blocked removals remain; nothing this pass can do about them
        state.record.drift_passes = state.record.drift_passes.saturating_add(1);
        let error = Error::DriftPersistence {
            passes: state.record.drift_passes,
            drift: remaining,
        };
        let ctx = self.context(state, true);
        if self.fire(state, SwitchEvent::RetryBudgetExhausted, &ctx) {
            warn!(cluster = %state.topology.name(), error = %error, "Streaming drift persisted");
            return Step {
                outcome: SwitchOutcome::failed(&error),
                requeue_after: self.config.error_backoff.delay_for_attempt(state.record.drift_passes),
                error: Some(error),
            };
        }

        Step {
            outcome: steady_outcome,
            requeue_after: self
                .config
                .error_backoff
                .delay_for_attempt(state.record.drift_passes - 1),
            error: Some(error),
        }
    }

    /// The pinned transition target and its observation
    ///
    /// An unobserved target is never replaced; the attempt counts against the
    /// retry budget instead.
    fn observed_target<'o>(
        &self,
        state: &PassState,
        observations: &'o BTreeMap<InstanceId, ObservedReplication>,
    ) -> Result<(InstanceId, &'o ObservedReplication)> {
        let Some(target) = state.topology.current_primary() else {
            return Err(Error::NoEligiblePrimary(
                "no transition target is designated".to_string(),
            ));
        };
        match observations.get(target) {
            Some(observed) => Ok((target.clone(), observed)),
            None => Err(Error::NoEligiblePrimary(format!(
                "transition target {} is not observable",
                target
            ))),
        }
    }
}

fn is_steady(phase: SwitchPhase) -> bool {
    matches!(phase, SwitchPhase::SteadyReplica | SwitchPhase::SteadyPrimary)
}

/// Stop external streaming on the designated primary and make it writable
async fn promote_instance<C: InstanceCommander>(
    runner: &CommandRunner<'_, C>,
    primary: &InstanceId,
    observed: &ObservedReplication,
) -> Result<()> {
    if observed.is_receiving() {
        runner.issue(primary, &Command::ClearUpstream).await?;
        runner
            .wait_for(primary, "stop streaming", |o| !o.is_receiving())
            .await?;
    }
    if observed.in_recovery {
        runner.issue(primary, &Command::Promote).await?;
    }
    runner
        .wait_for(primary, "leave recovery", |o| !o.in_recovery && !o.is_receiving())
        .await?;
    Ok(())
}

/// Put the primary into recovery, streaming from the external source
async fn demote_instance<C: InstanceCommander>(
    runner: &CommandRunner<'_, C>,
    primary: &InstanceId,
    observed: &ObservedReplication,
    source: &ExternalSource,
) -> Result<()> {
    let host = source.host();
    let conninfo = source.conninfo(primary.as_str());

    if !observed.in_recovery {
        runner.issue(primary, &Command::Demote(conninfo)).await?;
    } else if observed.sender_host != host {
        runner.issue(primary, &Command::SetUpstream(conninfo)).await?;
    }
    runner
        .wait_for(primary, "follow external source", |o| {
            o.in_recovery && o.sender_host == host
        })
        .await?;
    Ok(())
}

/// Accept or reject a change of the declared external source
///
/// A new source takes effect only while the cluster is `SteadyReplica`, or
/// `Failed` on its way back there. Any other phase with a different recorded
/// source is a configuration error.
pub fn accept_source_change(record: &mut SwitchStatus, topology: &ClusterTopology) -> Result<()> {
    let Some(declared) = topology.external_source().map(|s| s.name()) else {
        return Ok(());
    };

    let acting = effective_phase(record, topology.intent());
    match record.source.as_deref() {
        Some(recorded) if recorded == declared => Ok(()),
        recorded if acting == SwitchPhase::SteadyReplica => {
            if let Some(recorded) = recorded {
                info!(
                    cluster = %topology.name(),
                    from = %recorded,
                    to = %declared,
                    "External source changed"
                );
            }
            record.source = Some(declared.to_string());
            Ok(())
        }
        Some(recorded) => Err(Error::ConfigurationError(format!(
            "external source changed from {} to {} while {}; source changes take effect only in SteadyReplica",
            recorded, declared, record.phase
        ))),
        None => Ok(()),
    }
}

/// Phase whose role the designated primary is acting out
///
/// A failed cluster acts out the phase it failed during, or the phase
/// matching intent when none was recorded.
fn effective_phase(record: &SwitchStatus, intent: RoleIntent) -> SwitchPhase {
    match (record.phase, record.failed_during) {
        (SwitchPhase::Failed, Some(during)) if during != SwitchPhase::Failed => during,
        (SwitchPhase::Failed, _) => initial_phase(intent),
        (phase, _) => phase,
    }
}

/// Record the designated primary for this pass
///
/// Returns an error when no instance may act as primary, which the state
/// machine turns into `NoEligiblePrimary`:
/// - `SteadyReplica` re-elects among healthy instances
/// - `SteadyPrimary` keeps its write leader, which must be healthy and, to
///   leave `Failed`, observed out of recovery
/// - an in-flight transition keeps its pinned target; leaving `Failed`
///   requires the target to be healthy
fn designate_primary(
    record: &mut SwitchStatus,
    topology: &mut ClusterTopology,
    observations: &BTreeMap<InstanceId, ObservedReplication>,
    health: &ObservedHealth,
) -> Result<()> {
    let failed = record.phase == SwitchPhase::Failed;
    let acting = effective_phase(record, topology.intent());

    match acting {
        SwitchPhase::SteadyReplica | SwitchPhase::Failed => {
            adopt_observed_primary(topology, observations, health, acting);
            elect_primary(topology, health)?;
            Ok(())
        }
        SwitchPhase::SteadyPrimary => {
            adopt_observed_primary(topology, observations, health, acting);
            let Some(leader) = topology.current_primary() else {
                return Err(Error::NoEligiblePrimary(
                    "no write leader is recorded or observed".to_string(),
                ));
            };
            if !health.is_healthy(leader) {
                return Err(Error::NoEligiblePrimary(format!(
                    "write leader {} is not healthy",
                    leader
                )));
            }
            if failed && observations.get(leader).is_none_or(|o| o.in_recovery) {
                return Err(Error::NoEligiblePrimary(format!(
                    "write leader {} is in recovery",
                    leader
                )));
            }
            Ok(())
        }
        SwitchPhase::PromotingToPrimary | SwitchPhase::DemotingToReplica => {
            pin_target(record, topology, observations, health, acting);
            let Some(target) = topology.current_primary() else {
                return Err(Error::NoEligiblePrimary(
                    "no transition target is recorded or observed".to_string(),
                ));
            };
            if failed && !health.is_healthy(target) {
                return Err(Error::NoEligiblePrimary(format!(
                    "transition target {} is not healthy",
                    target
                )));
            }
            Ok(())
        }
    }
}

/// Keep an in-flight transition on the instance it started with
///
/// Falls back to the recorded primary, then to an instance observed acting
/// the part, and only then to election. Whatever is chosen is pinned.
fn pin_target(
    record: &mut SwitchStatus,
    topology: &mut ClusterTopology,
    observations: &BTreeMap<InstanceId, ObservedReplication>,
    health: &ObservedHealth,
    acting: SwitchPhase,
) {
    if let Some(target) = record.target.as_deref() {
        match topology.set_current_primary(InstanceId::from(target)) {
            Ok(()) => return,
            Err(e) => warn!(
                cluster = %topology.name(),
                target = %target,
                error = %e,
                "Pinned transition target is no longer a member"
            ),
        }
    }

    adopt_observed_primary(topology, observations, health, acting);
    if topology.current_primary().is_none()
        && let Err(e) = elect_primary(topology, health)
    {
        debug!(cluster = %topology.name(), error = %e, "No transition target to pin");
    }

    record.target = topology.current_primary().map(|p| p.to_string());
    if let Some(target) = &record.target {
        info!(cluster = %topology.name(), target = %target, phase = %acting, "Pinned transition target");
    }
}

/// Seed the designated primary from observed roles when none is recorded
///
/// Picks a healthy instance already acting the part: not in recovery for a
/// primary role, receiving from the external source for a replica role. An
/// in-flight transition prefers a writable instance, then one streaming from
/// the source.
fn adopt_observed_primary(
    topology: &mut ClusterTopology,
    observations: &BTreeMap<InstanceId, ObservedReplication>,
    health: &ObservedHealth,
    acting: SwitchPhase,
) {
    if topology.current_primary().is_some() {
        return;
    }
    let source_host = topology.external_source().map(|s| s.host().to_string());

    let find = |acts: &dyn Fn(&ObservedReplication) -> bool| {
        topology
            .instances()
            .iter()
            .filter(|id| health.is_healthy(id))
            .find(|id| observations.get(*id).is_some_and(acts))
            .cloned()
    };
    let writable = |o: &ObservedReplication| !o.in_recovery;
    let streaming = |o: &ObservedReplication| {
        o.is_receiving() && Some(o.sender_host.as_str()) == source_host.as_deref()
    };

    let candidate = match acting {
        SwitchPhase::SteadyPrimary => find(&writable),
        SwitchPhase::SteadyReplica | SwitchPhase::Failed => find(&streaming),
        SwitchPhase::PromotingToPrimary | SwitchPhase::DemotingToReplica => {
            find(&writable).or_else(|| find(&streaming))
        }
    };

    if let Some(candidate) = candidate {
        debug!(cluster = %topology.name(), instance = %candidate, "Adopting observed primary");
        if let Err(e) = topology.set_current_primary(candidate) {
            warn!(cluster = %topology.name(), error = %e, "Could not adopt observed primary");
        }
    }
}
