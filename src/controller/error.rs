//! Error types for the replica cluster switchover controller

use std::time::Duration;

use thiserror::Error;

use crate::resources::instance::InstanceError;
use crate::topology::TopologyError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ConfigurationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// Malformed topology or intent; fatal until the owner corrects the resource
    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    /// No healthy instance can be designated primary
    #[error("No eligible primary: {0}")]
    NoEligiblePrimary(String),

    /// A live reconfiguration did not take effect in time
    #[error("Timed out after {timeout:?} waiting for {instance} to {operation}")]
    ReconfigurationTimeout {
        instance: String,
        operation: String,
        timeout: Duration,
    },

    /// Observed streaming edges did not converge after repeated passes
    #[error("Streaming topology did not converge after {passes} passes ({drift} edges still drifting)")]
    DriftPersistence { passes: u32, drift: usize },

    #[error("Instance command failed: {0}")]
    InstanceError(#[from] InstanceError),

    #[error("Transient error (will retry): {0}")]
    TransientError(String),
}

impl From<TopologyError> for Error {
    fn from(e: TopologyError) -> Self {
        match e {
            TopologyError::Configuration(msg) => Error::ConfigurationError(msg),
            e @ TopologyError::NoEligiblePrimary { .. } => Error::NoEligiblePrimary(e.to_string()),
        }
    }
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 404)
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 409)
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::ConfigurationError(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::NoEligiblePrimary(_) => true,
            Error::ReconfigurationTimeout { .. } => true,
            Error::DriftPersistence { .. } => true,
            Error::InstanceError(_) => true,
            Error::TransientError(_) => true,
        }
    }

    /// Machine-readable reason published on the switch condition
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubernetesApiError",
            Error::SerializationError(_) => "SerializationError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::ConfigurationError(_) => "InvalidConfiguration",
            Error::NoEligiblePrimary(_) => "NoEligiblePrimary",
            Error::ReconfigurationTimeout { .. } => "ReconfigurationTimeout",
            Error::DriftPersistence { .. } => "DriftPersistence",
            Error::InstanceError(_) => "InstanceCommandFailed",
            Error::TransientError(_) => "TransientError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff used while polling an instance for a state change
    pub fn polling() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for the owner to correct the resource
            self.max_delay
        }
    }
}
