//! Bounded command issuing and state polling against live instances
//!
//! Every command is retried a few times with backoff and every wait polls the
//! instance until a predicate holds or a deadline passes. Neither ever blocks
//! longer than the configured reconfiguration timeout.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::config::SwitchoverConfig;
use crate::controller::error::{Error, Result};
use crate::resources::instance::{InstanceCommander, InstanceResult};
use crate::topology::{InstanceId, ObservedReplication};

/// A reconfiguration sent to one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetUpstream(String),
    ClearUpstream,
    Promote,
    Demote(String),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetUpstream(_) => write!(f, "set upstream"),
            Command::ClearUpstream => write!(f, "clear upstream"),
            Command::Promote => write!(f, "promote"),
            Command::Demote(_) => write!(f, "demote"),
        }
    }
}

/// Issues commands and waits for their effect
pub struct CommandRunner<'a, C> {
    commander: &'a C,
    config: &'a SwitchoverConfig,
    issued: AtomicUsize,
}

impl<'a, C: InstanceCommander> CommandRunner<'a, C> {
    pub fn new(commander: &'a C, config: &'a SwitchoverConfig) -> Self {
        Self {
            commander,
            config,
            issued: AtomicUsize::new(0),
        }
    }

    /// Number of commands sent, retries included
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Send a command, retrying failures up to the configured budget
    pub async fn issue(&self, instance: &InstanceId, command: &Command) -> Result<()> {
        let limit = self.config.reconfiguration_timeout;
        let mut attempt = 0;

        loop {
            self.issued.fetch_add(1, Ordering::Relaxed);
            debug!(instance = %instance, command = %command, attempt, "Issuing instance command");

            let error = match timeout(limit, self.send(instance, command)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => Error::from(e),
                Err(_) => Error::ReconfigurationTimeout {
                    instance: instance.to_string(),
                    operation: command.to_string(),
                    timeout: limit,
                },
            };

            attempt += 1;
            if attempt > self.config.command_retries {
                warn!(instance = %instance, command = %command, error = %error, "Instance command failed");
                return Err(error);
            }

            let delay = self.config.wait_backoff.delay_for_attempt(attempt - 1);
            debug!(instance = %instance, error = %error, ?delay, "Retrying instance command");
            sleep(delay).await;
        }
    }

    async fn send(&self, instance: &InstanceId, command: &Command) -> InstanceResult<()> {
        match command {
            Command::SetUpstream(conninfo) => {
                self.commander
                    .set_upstream(instance, Some(conninfo.as_str()))
                    .await
            }
            Command::ClearUpstream => self.commander.set_upstream(instance, None).await,
            Command::Promote => self.commander.promote(instance).await,
            Command::Demote(conninfo) => self.commander.demote(instance, conninfo).await,
        }
    }

    /// Poll the instance until `predicate` holds
    ///
    /// Observation errors are expected while an instance restarts and are
    /// only logged. Fails with `ReconfigurationTimeout` at the deadline.
    pub async fn wait_for<P>(
        &self,
        instance: &InstanceId,
        operation: &str,
        predicate: P,
    ) -> Result<ObservedReplication>
    where
        P: Fn(&ObservedReplication) -> bool,
    {
        let limit = self.config.reconfiguration_timeout;
        let deadline = Instant::now() + limit;
        let mut poll = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.commander.observe(instance)).await {
                Ok(Ok(observed)) if predicate(&observed) => return Ok(observed),
                Ok(Ok(observed)) => {
                    debug!(instance = %instance, operation, ?observed, "Waiting for instance");
                }
                Ok(Err(e)) => {
                    debug!(instance = %instance, operation, error = %e, "Observation failed while waiting");
                }
                Err(_) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ReconfigurationTimeout {
                    instance: instance.to_string(),
                    operation: operation.to_string(),
                    timeout: limit,
                });
            }

            sleep(self.config.wait_backoff.delay_for_attempt(poll).min(remaining)).await;
            poll += 1;
        }
    }
}
