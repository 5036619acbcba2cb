//! Identity provider error types.

use thiserror::Error;

/// Error raised by identity provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Invalid email or password
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Browser/popup OAuth flow error
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// The provider rejected the request due to rate limiting
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// A sign-in link was malformed or not issued by this provider
    #[error("Invalid sign-in link: {0}")]
    InvalidSignInLink(String),

    /// Operation requires a signed-in identity
    #[error("No identity is signed in")]
    NotSignedIn,

    /// Token refresh error
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// Generic provider rejection (non-2xx with provider message)
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,
}

/// Result type alias using ProviderError.
pub type ProviderResult<T> = Result<T, ProviderError>;
