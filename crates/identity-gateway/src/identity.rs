//! Provider identity records.

use serde::{Deserialize, Serialize};

/// The identity provider's representation of a signed-in principal.
///
/// This is a plain data record. Proof-token production and reloading are
/// gateway operations, not methods on the identity itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    /// Unique subject ID assigned by the provider.
    pub subject_id: String,
    /// Email address, if the identity carries one.
    pub email: Option<String>,
    /// Whether the provider has confirmed the email address.
    pub email_verified: bool,
    /// Whether this is an anonymous (guest) identity.
    pub is_anonymous: bool,
}

impl ProviderIdentity {
    /// Returns true if this identity must verify its email before it can
    /// be exchanged for an application session.
    ///
    /// Anonymous identities are exempt from verification gating.
    pub fn needs_email_validation(&self) -> bool {
        if self.is_anonymous {
            return false;
        }
        !self.email_verified
    }
}

/// Social sign-in providers supported by the popup/browser OAuth flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialProvider {
    Google,
    GitHub,
    Facebook,
    Microsoft,
}

impl SocialProvider {
    /// Provider identifier as used in authorize URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SocialProvider::Google => "google",
            SocialProvider::GitHub => "github",
            SocialProvider::Facebook => "facebook",
            SocialProvider::Microsoft => "azure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(email_verified: bool, is_anonymous: bool) -> ProviderIdentity {
        ProviderIdentity {
            subject_id: "sub-1".to_string(),
            email: Some("a@b.com".to_string()),
            email_verified,
            is_anonymous,
        }
    }

    #[test]
    fn test_verified_identity_needs_no_validation() {
        assert!(!identity(true, false).needs_email_validation());
    }

    #[test]
    fn test_unverified_identity_needs_validation() {
        assert!(identity(false, false).needs_email_validation());
    }

    #[test]
    fn test_anonymous_identity_is_exempt() {
        assert!(!identity(false, true).needs_email_validation());
    }

    #[test]
    fn test_social_provider_identifiers() {
        assert_eq!(SocialProvider::Google.as_str(), "google");
        assert_eq!(SocialProvider::GitHub.as_str(), "github");
        assert_eq!(SocialProvider::Microsoft.as_str(), "azure");
    }
}
