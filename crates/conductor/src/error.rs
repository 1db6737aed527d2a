//! Backend error type.

use conductor_protocol::ErrorKind;
use thiserror::Error;

use crate::container::ContainerError;
use crate::transport::TransportError;

pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by [`crate::backend::AgentBackend`] operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The runtime slot could not be allocated or never became healthy.
    #[error("startup failed: {0}")]
    Startup(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The agent sent something that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session not found: {0}")]
    NotFound(String),

    /// The operation was cut short by interrupt or stop.
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    /// Category reported on error events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Startup(_) | BackendError::Container(_) => ErrorKind::Startup,
            BackendError::Transport(_) => ErrorKind::Transport,
            BackendError::Protocol(_) => ErrorKind::Protocol,
            BackendError::NotFound(_) => ErrorKind::NotFound,
            BackendError::Cancelled | BackendError::Other(_) => ErrorKind::Internal,
        }
    }
}
