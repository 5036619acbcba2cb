//! Backend session exchanger trait and the application user record.

use crate::error::ExchangeResult;
use serde::{Deserialize, Serialize};

/// The backend's representation of an authenticated principal, obtained by
/// exchanging a provider proof token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationUser {
    /// Backend-assigned user ID.
    pub user_id: String,
    /// Email address on record.
    pub email: String,
    /// Full display name.
    #[serde(default)]
    pub name_full: String,
    /// First name.
    #[serde(default)]
    pub name_first: String,
    /// Role names granted to this user.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Free-form application data attached by the backend.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Exchanges a provider proof token for an application session.
#[trait_variant::make(SessionExchanger: Send)]
pub trait LocalSessionExchanger {
    /// Exchange a proof token for an application user record.
    ///
    /// `Ok(None)` means the exchange completed but the backend granted no
    /// session; callers treat it the same as a failed exchange.
    async fn login(&self, proof_token: &str) -> ExchangeResult<Option<ApplicationUser>>;

    /// Tear down the backend session. Best-effort; callers log and swallow
    /// errors.
    async fn logout(&self) -> ExchangeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_user_deserializes_camel_case() {
        let user: ApplicationUser = serde_json::from_str(
            r#"{
                "userId": "u1",
                "email": "a@b.com",
                "nameFull": "Ada Lovelace",
                "nameFirst": "Ada",
                "roles": ["admin"],
                "extra": {"plan": "pro"}
            }"#,
        )
        .unwrap();

        assert_eq!(user.user_id, "u1");
        assert_eq!(user.name_first, "Ada");
        assert_eq!(user.roles, vec!["admin".to_string()]);
        assert_eq!(user.extra["plan"], "pro");
    }

    #[test]
    fn test_application_user_optional_fields_default() {
        let user: ApplicationUser =
            serde_json::from_str(r#"{ "userId": "u2", "email": "c@d.com" }"#).unwrap();

        assert!(user.name_full.is_empty());
        assert!(user.roles.is_empty());
        assert!(user.extra.is_null());
    }
}
