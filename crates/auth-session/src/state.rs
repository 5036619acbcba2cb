//! The published session snapshot.

use identity_gateway::ProviderIdentity;
use session_exchange::ApplicationUser;

/// Reconciled, publishable session state.
///
/// Invariants maintained by the store:
/// - `is_loading` is true for the whole span between an identity-change
///   notification and the end of its reconciliation.
/// - `user` is present only if a provider identity is present, the identity
///   is anonymous or email-verified, and the backend exchange succeeded.
/// - `provider_identity` absent implies `user` absent.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Application user from the last successful backend exchange.
    pub user: Option<ApplicationUser>,
    /// Identity the provider currently reports.
    pub provider_identity: Option<ProviderIdentity>,
    /// Whether the current identity counts as email-verified (anonymous
    /// identities always do).
    pub is_email_verified: bool,
    /// True while a reconciliation is in flight.
    pub is_loading: bool,
}

impl SessionState {
    /// State at store creation: nothing known yet, first reconciliation
    /// pending.
    pub(crate) fn initial() -> Self {
        Self {
            user: None,
            provider_identity: None,
            is_email_verified: false,
            is_loading: true,
        }
    }

    /// Returns true if an application user is present.
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}
