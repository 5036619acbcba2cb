//! Route protection decisions.
//!
//! A pure function from the current snapshot to what a protected route
//! should do. Hosts render the decision however their UI layer works; the
//! priority order here is the contract.

use crate::state::SessionState;

/// What a protected route should do for the current session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// A reconciliation is in flight; render a placeholder, decide nothing.
    Loading,
    /// An identity is signed in but its email is unverified; send it to the
    /// verification screen, resuming at `resume_to` afterwards.
    RedirectToVerifyEmail { resume_to: String },
    /// No application session; render the login flow, returning to
    /// `redirect_to` on success.
    RenderLogin { redirect_to: String },
    /// Fully authenticated; render the protected content.
    RenderProtected,
}

/// Decide what a protected route at `requested` should do.
///
/// Priority: loading wins over everything (an in-flight reconciliation must
/// never flash the login screen), then unverified identities go to
/// verification, then a missing application user means login.
pub fn decide(state: &SessionState, requested: &str) -> RouteDecision {
    if state.is_loading {
        return RouteDecision::Loading;
    }

    if state.provider_identity.is_some() && !state.is_email_verified {
        return RouteDecision::RedirectToVerifyEmail {
            resume_to: requested.to_string(),
        };
    }

    if state.user.is_none() {
        return RouteDecision::RenderLogin {
            redirect_to: requested.to_string(),
        };
    }

    RouteDecision::RenderProtected
}
