//! HTTP implementation of the backend session exchanger.

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchanger::{ApplicationUser, SessionExchanger};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default backend login path.
pub const DEFAULT_LOGIN_PATH: &str = "/auth/login";

/// Default backend logout path.
pub const DEFAULT_LOGOUT_PATH: &str = "/auth/logout";

/// Login request body sent to the backend.
#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "idToken")]
    id_token: &'a str,
}

/// Login response body from the backend.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    user: Option<ApplicationUser>,
}

/// reqwest-based [`SessionExchanger`] against the application backend.
#[derive(Clone)]
pub struct HttpSessionExchanger {
    http_client: reqwest::Client,
    base_url: String,
    login_path: String,
    logout_path: String,
}

impl HttpSessionExchanger {
    /// Create an exchanger with the default endpoint paths.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_paths(base_url, DEFAULT_LOGIN_PATH, DEFAULT_LOGOUT_PATH)
    }

    /// Create an exchanger with custom endpoint paths.
    pub fn with_paths(
        base_url: impl Into<String>,
        login_path: impl Into<String>,
        logout_path: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            login_path: login_path.into(),
            logout_path: logout_path.into(),
        }
    }

    fn login_url(&self) -> String {
        format!("{}{}", self.base_url, self.login_path)
    }

    fn logout_url(&self) -> String {
        format!("{}{}", self.base_url, self.logout_path)
    }
}

impl SessionExchanger for HttpSessionExchanger {
    async fn login(&self, proof_token: &str) -> ExchangeResult<Option<ApplicationUser>> {
        let url = self.login_url();
        debug!(url = %url, "Exchanging proof token for application session");

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&LoginRequest {
                id_token: proof_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Backend login failed");
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let data: LoginResponse = response.json().await?;
        match data.user {
            Some(user) => {
                info!(user_id = %user.user_id, "Backend login complete");
                Ok(Some(user))
            }
            None => {
                warn!("Backend login succeeded but returned no user record");
                Ok(None)
            }
        }
    }

    async fn logout(&self) -> ExchangeResult<()> {
        let url = self.logout_url();
        debug!(url = %url, "Tearing down backend session");

        let response = self.http_client.post(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Backend logout failed");
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!("Backend logout complete");
        Ok(())
    }
}
