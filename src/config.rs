//! Operator configuration
//!
//! All settings come from environment variables, read once at startup.
//! Unset variables fall back to defaults; malformed values are rejected.

use std::time::Duration;

use thiserror::Error;

use crate::controller::error::BackoffConfig;

/// Configuration errors detected at startup
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Settings governing promotion, demotion and streaming enforcement
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchoverConfig {
    /// Upper bound for any single wait on a live instance
    pub reconfiguration_timeout: Duration,
    /// Failed attempts tolerated in a phase before entering `Failed`
    pub max_attempts: u32,
    /// Consecutive drifting passes tolerated before entering `Failed`
    pub drift_budget: u32,
    /// Immediate retries for a single instance command
    pub command_retries: u32,
    /// Delays between command retries and state polls
    pub wait_backoff: BackoffConfig,
}

impl Default for SwitchoverConfig {
    fn default() -> Self {
        Self {
            reconfiguration_timeout: Duration::from_secs(30),
            max_attempts: 5,
            drift_budget: 3,
            command_retries: 3,
            wait_backoff: BackoffConfig::polling(),
        }
    }
}

/// Top-level operator configuration
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    pub switchover: SwitchoverConfig,
    /// Requeue interval once a cluster is steady
    pub steady_requeue: Duration,
    /// Requeue interval while a transition is in flight
    pub transition_requeue: Duration,
    /// Backoff applied by the controller error policy
    pub error_backoff: BackoffConfig,
    /// Restrict the controller to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            switchover: SwitchoverConfig::default(),
            steady_requeue: Duration::from_secs(30),
            transition_requeue: Duration::from_secs(2),
            error_backoff: BackoffConfig::default(),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let timeout_secs = parse_u64(
            &lookup,
            "SWITCHOVER_TIMEOUT_SECS",
            defaults.switchover.reconfiguration_timeout.as_secs(),
        )?;
        let max_attempts = parse_u32(
            &lookup,
            "SWITCHOVER_MAX_ATTEMPTS",
            defaults.switchover.max_attempts,
        )?;
        let drift_budget = parse_u32(
            &lookup,
            "DRIFT_RETRY_BUDGET",
            defaults.switchover.drift_budget,
        )?;
        let steady_secs = parse_u64(
            &lookup,
            "STEADY_REQUEUE_SECS",
            defaults.steady_requeue.as_secs(),
        )?;
        let transition_secs = parse_u64(
            &lookup,
            "TRANSITION_REQUEUE_SECS",
            defaults.transition_requeue.as_secs(),
        )?;

        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());

        Ok(Self {
            switchover: SwitchoverConfig {
                reconfiguration_timeout: Duration::from_secs(timeout_secs),
                max_attempts,
                drift_budget,
                ..defaults.switchover
            },
            steady_requeue: Duration::from_secs(steady_secs),
            transition_requeue: Duration::from_secs(transition_secs),
            error_backoff: defaults.error_backoff,
            watch_namespace,
        })
    }
}

fn parse_u64<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(0) => Err(ConfigError::InvalidValue {
                name,
                value,
                reason: "must be greater than zero",
            }),
            Ok(parsed) => Ok(parsed),
            Err(_) => Err(ConfigError::InvalidValue {
                name,
                value,
                reason: "not an unsigned integer",
            }),
        },
    }
}

fn parse_u32<F>(lookup: &F, name: &'static str, default: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_u64(lookup, name, u64::from(default))?;
    u32::try_from(parsed).map_err(|_| ConfigError::InvalidValue {
        name,
        value: parsed.to_string(),
        reason: "out of range",
    })
}
