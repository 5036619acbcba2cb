//! Backend exchange error types.

use thiserror::Error;

/// Error raised by the backend session exchange.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The backend answered with a non-2xx status
    #[error("Backend rejected exchange: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed response body
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using ExchangeError.
pub type ExchangeResult<T> = Result<T, ExchangeError>;
