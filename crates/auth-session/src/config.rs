//! Library configuration.
//!
//! Configuration is an explicit value constructed at composition time and
//! passed by reference to the store and views. There is no global
//! initialize-once state, so "used before initialized" cannot occur.

use identity_gateway::SocialProvider;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity provider connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider project API URL.
    pub api_url: String,
    /// Publishable (anonymous) API key.
    pub publishable_key: String,
}

/// Sign-in methods a host application can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignInMethod {
    Google,
    GitHub,
    Facebook,
    Microsoft,
    EmailPassword,
    EmailLink,
    Anonymous,
}

impl SignInMethod {
    /// The social provider behind this method, if it is a social one.
    pub fn social_provider(&self) -> Option<SocialProvider> {
        match self {
            SignInMethod::Google => Some(SocialProvider::Google),
            SignInMethod::GitHub => Some(SocialProvider::GitHub),
            SignInMethod::Facebook => Some(SocialProvider::Facebook),
            SignInMethod::Microsoft => Some(SocialProvider::Microsoft),
            _ => None,
        }
    }
}

/// Backend endpoint paths for the session exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub login: String,
    pub logout: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            logout: "/auth/logout".to_string(),
        }
    }
}

/// Route paths used by the auth views and the route guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePaths {
    #[serde(default = "defaults::login")]
    pub login: String,
    #[serde(default = "defaults::signup")]
    pub signup: String,
    #[serde(default = "defaults::reset_password")]
    pub reset_password: String,
    #[serde(default = "defaults::sign_in_with_email")]
    pub sign_in_with_email: String,
    #[serde(default = "defaults::sign_in_with_password")]
    pub sign_in_with_password: String,
    #[serde(default = "defaults::verify_email")]
    pub verify_email: String,
    #[serde(default = "defaults::anonymous_login")]
    pub anonymous_login: String,
    /// Where to land after a successful login. Required.
    pub after_login: String,
    /// Where to land after signup; falls back to `after_login`.
    #[serde(default)]
    pub after_signup: Option<String>,
}

mod defaults {
    pub(super) fn login() -> String {
        "/p/login".to_string()
    }
    pub(super) fn signup() -> String {
        "/p/signup".to_string()
    }
    pub(super) fn reset_password() -> String {
        "/p/reset-password".to_string()
    }
    pub(super) fn sign_in_with_email() -> String {
        "/p/login-email".to_string()
    }
    pub(super) fn sign_in_with_password() -> String {
        "/p/login-password".to_string()
    }
    pub(super) fn verify_email() -> String {
        "/p/verify-email".to_string()
    }
    pub(super) fn anonymous_login() -> String {
        "/p/anonymous-login".to_string()
    }
}

impl RoutePaths {
    /// Default paths with the required post-login destination.
    pub fn new(after_login: impl Into<String>) -> Self {
        Self {
            login: defaults::login(),
            signup: defaults::signup(),
            reset_password: defaults::reset_password(),
            sign_in_with_email: defaults::sign_in_with_email(),
            sign_in_with_password: defaults::sign_in_with_password(),
            verify_email: defaults::verify_email(),
            anonymous_login: defaults::anonymous_login(),
            after_login: after_login.into(),
            after_signup: None,
        }
    }

    /// Post-signup destination, falling back to the post-login one.
    pub fn after_signup(&self) -> &str {
        self.after_signup.as_deref().unwrap_or(&self.after_login)
    }
}

/// A password failed the configured policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PasswordPolicyViolation {
    #[error("Password must be at least {min_length} characters")]
    TooShort { min_length: usize },
}

/// Password requirements enforced by signup and password-login views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self { min_length: 8 }
    }
}

impl PasswordPolicy {
    /// Check a candidate password against the policy.
    pub fn validate(&self, password: &str) -> Result<(), PasswordPolicyViolation> {
        if password.chars().count() < self.min_length {
            return Err(PasswordPolicyViolation::TooShort {
                min_length: self.min_length,
            });
        }
        Ok(())
    }
}

/// Complete library configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub provider: ProviderSettings,
    pub enabled_methods: Vec<SignInMethod>,
    #[serde(default)]
    pub endpoints: EndpointPaths,
    pub routes: RoutePaths,
    #[serde(default)]
    pub password: PasswordPolicy,
}

impl AuthConfig {
    /// Configuration with documented defaults for everything optional.
    pub fn new(provider: ProviderSettings, after_login: impl Into<String>) -> Self {
        Self {
            provider,
            enabled_methods: Vec::new(),
            endpoints: EndpointPaths::default(),
            routes: RoutePaths::new(after_login),
            password: PasswordPolicy::default(),
        }
    }

    /// Enable a set of sign-in methods.
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = SignInMethod>) -> Self {
        self.enabled_methods.extend(methods);
        self
    }

    /// Returns true if the given sign-in method is enabled.
    pub fn is_enabled(&self, method: SignInMethod) -> bool {
        self.enabled_methods.contains(&method)
    }
}
