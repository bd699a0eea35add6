//! Error types for actuator operations, and their retry classification.

use std::time::Duration;

use metal_apis::{DecodeError, EncodeError};
use thiserror::Error;

use crate::device::DeviceServiceError;
use crate::reconciler::Operation;
use crate::secrets::SecretStoreError;
use crate::store::MachineClientError;

/// How the orchestration runtime should retry a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Retrying with the same Machine fails the same way.
    Never,
    /// Retry with the runtime's default backoff.
    Backoff,
    /// Retry after a fixed delay.
    After(Duration),
}

/// Render `d` like Go's `time.Duration`: `20s`, `1m30s`, `1h0m0s`, `250ms`.
pub fn format_duration(d: &Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000, 6));
    }

    let secs = d.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let seconds = u128::from(seconds) * 1_000_000_000 + u128::from(d.subsec_nanos());
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", decimal(seconds, 1_000_000_000, 9)));
    out
}

/// `value / unit` with the remainder as trailing-zero-free decimals.
fn decimal(value: u128, unit: u128, digits: usize) -> String {
    let (whole, frac) = (value / unit, value % unit);
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = digits);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Failure to build a machine scope.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("failed to get machine config: {0}")]
    MachineConfig(#[source] DecodeError),

    #[error("failed to get machine provider status: {0}")]
    ProviderStatus(#[source] DecodeError),

    #[error("machine provider spec has no credentials secret")]
    CredentialsSecretUnset,

    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("secret {namespace}/{name} does not have \"{key}\" field set")]
    SecretKeyMissing {
        namespace: String,
        name: String,
        key: &'static str,
    },

    #[error("secret {namespace}/{name} field \"{key}\" is not valid UTF-8")]
    SecretNotUtf8 {
        namespace: String,
        name: String,
        key: &'static str,
    },

    #[error("failed to read secret: {0}")]
    SecretRead(#[source] SecretStoreError),
}

impl From<SecretStoreError> for ScopeError {
    fn from(err: SecretStoreError) -> Self {
        match err {
            SecretStoreError::NotFound { namespace, name } => {
                ScopeError::SecretNotFound { namespace, name }
            }
            other => ScopeError::SecretRead(other),
        }
    }
}

impl ScopeError {
    pub fn retry(&self) -> Retry {
        match self {
            ScopeError::MachineConfig(_)
            | ScopeError::ProviderStatus(_)
            | ScopeError::CredentialsSecretUnset
            | ScopeError::SecretNotUtf8 { .. } => Retry::Never,
            // The secret may show up or be fixed later.
            ScopeError::SecretNotFound { .. }
            | ScopeError::SecretKeyMissing { .. }
            | ScopeError::SecretRead(_) => Retry::Backoff,
        }
    }
}

/// The Machine does not carry what a provisioning operation needs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("machine is missing \"{0}\" label")]
    MissingLabel(&'static str),
}

/// Failure of a reconciler operation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed validating machine provider spec: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to {} device: {source}", .operation.verb())]
    Remote {
        operation: Operation,
        #[source]
        source: DeviceServiceError,
    },

    #[error("requeue in: {}", format_duration(.after))]
    RequeueAfter {
        operation: Operation,
        after: Duration,
    },

    #[error("device {id} is in failed state: {reason}")]
    DeviceFailed { id: String, reason: String },

    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    pub(crate) fn remote(operation: Operation, source: DeviceServiceError) -> Self {
        if source.is_cancelled() {
            ReconcileError::Cancelled
        } else {
            ReconcileError::Remote { operation, source }
        }
    }

    pub fn retry(&self) -> Retry {
        match self {
            ReconcileError::Validation(_) => Retry::Never,
            ReconcileError::RequeueAfter { after, .. } => Retry::After(*after),
            ReconcileError::Remote { .. }
            | ReconcileError::DeviceFailed { .. }
            | ReconcileError::Cancelled => Retry::Backoff,
        }
    }
}

/// Failure to write scope changes back to the Machine.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to update machine provider status: {0}")]
    Encode(#[from] EncodeError),

    #[error("failed to patch machine: {0}")]
    Patch(#[source] MachineClientError),

    #[error("failed to patch machine status: {0}")]
    PatchStatus(#[source] MachineClientError),
}

/// Error returned by the actuator to the orchestration runtime.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl ActuatorError {
    pub fn retry(&self) -> Retry {
        match self {
            ActuatorError::Scope(err) => err.retry(),
            ActuatorError::Reconcile(err) => err.retry(),
            ActuatorError::Persist(_) => Retry::Backoff,
        }
    }

    /// Fixed delay to requeue after, if the error asks for one.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self.retry() {
            Retry::After(after) => Some(after),
            _ => None,
        }
    }
}
