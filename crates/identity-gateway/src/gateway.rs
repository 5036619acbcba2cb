//! Identity gateway trait definition.
//!
//! The gateway is the only seam between this library and the identity
//! provider. Every sign-in method resolves to a [`ProviderIdentity`] or a
//! typed [`ProviderError`]; state-change notifications are delivered
//! through [`IdentityGateway::subscribe`].

use crate::error::ProviderResult;
use crate::identity::{ProviderIdentity, SocialProvider};
use tokio::sync::mpsc;

/// A single identity-change notification: the current identity, or `None`
/// when the provider reports signed-out.
pub type IdentityEvent = Option<ProviderIdentity>;

/// Receiver half of an identity-change subscription.
///
/// The gateway contract: the receiver yields the current identity (or
/// `None`) immediately at subscription time, and subsequently one event per
/// sign-in/sign-out, delivered serially.
pub type IdentityEvents = mpsc::UnboundedReceiver<IdentityEvent>;

/// Asynchronous adapter over an identity provider's client API.
#[trait_variant::make(IdentityGateway: Send)]
pub trait LocalIdentityGateway {
    /// Sign in through a social provider's browser/popup OAuth flow.
    async fn sign_in_with_provider(
        &self,
        provider: SocialProvider,
    ) -> ProviderResult<ProviderIdentity>;

    /// Sign in with email and password.
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> ProviderResult<ProviderIdentity>;

    /// Create a new identity with email and password.
    async fn sign_up_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> ProviderResult<ProviderIdentity>;

    /// Send a password-reset email.
    async fn send_password_reset(&self, email: &str) -> ProviderResult<()>;

    /// Send a passwordless sign-in link to the given email address.
    ///
    /// `continue_url` is where the provider redirects after the link is
    /// followed.
    async fn send_sign_in_link(&self, email: &str, continue_url: &str) -> ProviderResult<()>;

    /// Returns true if `link` looks like a sign-in link issued for this
    /// gateway's provider.
    fn is_sign_in_link(&self, link: &str) -> bool;

    /// Complete a passwordless sign-in from a link previously sent with
    /// [`send_sign_in_link`](LocalIdentityGateway::send_sign_in_link).
    async fn complete_sign_in_with_link(
        &self,
        email: &str,
        link: &str,
    ) -> ProviderResult<ProviderIdentity>;

    /// Sign in as an anonymous (guest) identity.
    async fn sign_in_anonymously(&self) -> ProviderResult<ProviderIdentity>;

    /// Ask the provider to send a verification email to the currently
    /// signed-in identity.
    async fn send_verification_email(&self) -> ProviderResult<()>;

    /// Re-fetch the current identity from the provider, picking up the
    /// latest verification and profile flags.
    ///
    /// Returns `None` when no identity is signed in. Does not emit a
    /// change notification; callers that need reconciliation re-run it
    /// explicitly.
    async fn reload_identity(&self) -> ProviderResult<Option<ProviderIdentity>>;

    /// Produce a proof token for the current identity, optionally forcing
    /// a refresh against the provider.
    async fn proof_token(&self, force_refresh: bool) -> ProviderResult<String>;

    /// Sign out of the provider. Local identity state is cleared even if
    /// the remote call fails.
    async fn sign_out(&self) -> ProviderResult<()>;

    /// The identity the gateway currently considers signed in.
    fn current_identity(&self) -> Option<ProviderIdentity>;

    /// Subscribe to identity-change notifications.
    ///
    /// Implementations must push the current identity (or `None`) onto the
    /// channel before returning, and must deliver later events serially.
    fn subscribe(&self) -> IdentityEvents;
}
