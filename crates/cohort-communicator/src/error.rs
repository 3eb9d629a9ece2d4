use std::time::Duration;

use cohort_transport::TransportError;

/// Errors surfaced by a [`Communicator`](crate::Communicator).
///
/// `Timeout` leaves the communicator usable. `Revoked` and `NotRunning`
/// are permanent for the communicator that produced them.
#[derive(Debug, thiserror::Error)]
pub enum CommunicatorError {
    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("security token mismatch")]
    TokenMismatch,

    #[error("communicator has been revoked")]
    Revoked,

    #[error("communicator not running: {0}")]
    NotRunning(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("group mismatch: {0}")]
    GroupMismatch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl CommunicatorError {
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        CommunicatorError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommunicatorError::Timeout { .. })
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self, CommunicatorError::Revoked)
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, CommunicatorError::NotRunning(_))
    }

    /// Errors after which a caller should revoke and shrink.
    pub fn is_failure_signal(&self) -> bool {
        self.is_timeout() || self.is_not_running() || self.is_revoked()
    }
}

// TLS failures on any edge are reported as encryption failures; other
// transport errors keep their detail.
impl From<TransportError> for CommunicatorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Tls(reason) => CommunicatorError::EncryptionFailed(reason),
            other => CommunicatorError::Transport(other),
        }
    }
}

impl From<rmp_serde::encode::Error> for CommunicatorError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CommunicatorError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CommunicatorError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CommunicatorError::Deserialization(e.to_string())
    }
}

pub type Result<T, E = CommunicatorError> = std::result::Result<T, E>;
