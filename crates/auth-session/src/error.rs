//! Session store error types.

use identity_gateway::ProviderError;
use thiserror::Error;

/// Error raised by the session store.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Identity provider error (re-raised from refresh's reload step)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Invalid transition in the reconcile phase machine
    #[error("Invalid session state transition: {0}")]
    InvalidStateTransition(String),

    /// The store's event task has been detached
    #[error("Session store is detached")]
    Detached,
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
