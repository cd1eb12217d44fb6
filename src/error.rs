//! Control plane error abstractions.

use thiserror::Error;

/// Errors returned from control plane interactions.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// The control plane could not be reached, or did not answer in time.
    ///
    /// This is the only transient variant. The convergence controller will retry it with backoff.
    #[error("control plane unavailable: {0:#}")]
    Unavailable(anyhow::Error),
    /// The control plane refused the given command.
    #[error("command `{command}` rejected by control plane: {reason}")]
    CommandRejected { command: String, reason: String },
    /// The status returned by the control plane does not fit the cluster data model.
    #[error("malformed cluster status: {0}")]
    MalformedStatus(String),
}

impl ControlPlaneError {
    /// Check if this error is transient, and may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// A short static label for this error's kind, used for logging & metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::CommandRejected { .. } => "command_rejected",
            Self::MalformedStatus(_) => "malformed_status",
        }
    }
}

/// A result type used with the control plane.
pub type ControlResult<T> = ::std::result::Result<T, ControlPlaneError>;
