//! Registry error taxonomy.
//!
//! Errors are `Clone` so one single-flight fetch result can be handed to
//! every waiting caller.

use thiserror::Error;

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Connection failure or timeout talking to the coordination store.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Intake queue is saturated; the caller must resubmit.
    #[error("registration queue is full, dropped intent for service {0}")]
    QueueFull(String),

    /// The keep-alive stream reported the lease gone.
    #[error("lease {0} lost")]
    LeaseLost(i64),

    #[error("service {0} not found")]
    NotFound(String),

    #[error("unknown backend plugin: {0}")]
    UnknownBackend(String),

    #[error("backend plugin {0} is already registered")]
    DuplicateBackend(String),

    #[error("invalid service: {0}")]
    InvalidService(String),

    #[error("encoding error: {0}")]
    Codec(String),

    /// The coordinator is no longer accepting intents.
    #[error("registry has been shut down")]
    ShutDown,
}

impl RegistryError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
