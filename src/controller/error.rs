//! Error types for the cluster and operation controllers

use std::time::Duration;

use thiserror::Error;

/// Error variants are named with the `Error` suffix where they wrap a lower
/// layer (e.g., `KubeError`) and after the failure otherwise.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Patroni API error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    /// No unique factory for a resource kind, or two factories emitted the same key
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The cluster does not have exactly one primary instance
    #[error("Invalid cluster state: {0}")]
    InvalidClusterState(String),

    /// Optimistic concurrency check failed while writing an object
    #[error("Conflict applying {0}")]
    ApplyConflict(String),

    /// A single object could not be created, patched or deleted
    #[error("Failed to apply {key}: {message}")]
    ApplyFailure { key: String, message: String },

    /// Optimistic concurrency check failed while writing a status
    #[error("Conflict updating status of {0}")]
    StatusConflict(String),

    #[error("Instance {instance} did not become ready within {timeout:?}")]
    ReadinessTimeout { instance: String, timeout: Duration },

    /// The restart state machine refused a phase change
    #[error("Invalid restart transition: {0}")]
    InvalidTransition(String),

    #[error("Switchover rejected: {0}")]
    SwitchoverRejected(String),

    /// Patroni answered a PostgreSQL restart with an error status
    #[error("Restart rejected: {0}")]
    RestartRejected(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::HttpError(_) => true,
            Error::ApplyConflict(_) | Error::StatusConflict(_) => true,
            Error::ApplyFailure { .. } => true,
            Error::NotFound(_) => true,
            Error::ConfigurationError(_) => false,
            Error::InvalidClusterState(_) => false,
            Error::ValidationError(_) => false,
            Error::ReadinessTimeout { .. } => false,
            Error::InvalidTransition(_) => false,
            Error::SwitchoverRejected(_) => false,
            Error::RestartRejected(_) => false,
            Error::Cancelled(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }

    /// Check if this error is an optimistic concurrency failure
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::ApplyConflict(_) | Error::StatusConflict(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 409,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
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
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error
    ///
    /// Conflicts requeue at the initial delay so the next pass re-reads live
    /// state promptly; other retryable errors back off exponentially.
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_conflict() {
            self.delay_for_attempt(0)
        } else if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}
