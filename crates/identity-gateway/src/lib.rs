//! Identity provider gateway.
//!
//! This crate provides:
//! - The [`IdentityGateway`] trait: every sign-in method the library
//!   supports, plus identity-change subscriptions
//! - [`HttpIdentityGateway`]: a reqwest implementation against the
//!   provider's REST auth API
//! - [`OAuthCallbackServer`]: loopback listener for browser/popup social
//!   sign-in

mod error;
mod gateway;
mod http;
mod identity;
mod oauth;

pub use error::{ProviderError, ProviderResult};
pub use gateway::{IdentityEvent, IdentityEvents, IdentityGateway, LocalIdentityGateway};
pub use http::HttpIdentityGateway;
pub use identity::{ProviderIdentity, SocialProvider};
pub use oauth::{
    CallbackOutcome, OAuthCallbackServer, DEFAULT_CALLBACK_PORT, DEFAULT_CALLBACK_TIMEOUT_SECS,
};
