//! HTTP implementation of the identity gateway.
//!
//! Speaks the provider's REST auth dialect under `/auth/v1/`. Holds the
//! current token set and identity, and fans out identity-change events to
//! subscribers on every sign-in and sign-out.

use crate::error::{ProviderError, ProviderResult};
use crate::gateway::{IdentityEvent, IdentityEvents, IdentityGateway};
use crate::identity::{ProviderIdentity, SocialProvider};
use crate::oauth::{
    percent_encode, OAuthCallbackServer, DEFAULT_CALLBACK_PORT, DEFAULT_CALLBACK_TIMEOUT_SECS,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

/// Token grant response from the provider.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: UserPayload,
}

/// User record as returned by the provider.
#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_confirmed_at: Option<String>,
    #[serde(default)]
    is_anonymous: bool,
}

impl UserPayload {
    fn into_identity(self) -> ProviderIdentity {
        ProviderIdentity {
            subject_id: self.id,
            email: self.email,
            email_verified: self.email_confirmed_at.is_some(),
            is_anonymous: self.is_anonymous,
        }
    }
}

/// Current provider session tokens.
#[derive(Debug, Clone)]
struct TokenSet {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl TokenSet {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Default)]
struct GatewayInner {
    tokens: Option<TokenSet>,
    identity: Option<ProviderIdentity>,
    subscribers: Vec<mpsc::UnboundedSender<IdentityEvent>>,
}

impl GatewayInner {
    /// Fan out one event to all live subscribers, pruning closed ones.
    fn emit(&mut self, event: &IdentityEvent) {
        self.subscribers
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

/// reqwest-based [`IdentityGateway`] against the provider's REST auth API.
pub struct HttpIdentityGateway {
    http_client: reqwest::Client,
    api_url: String,
    publishable_key: String,
    callback_port: u16,
    callback_timeout_secs: u64,
    inner: Mutex<GatewayInner>,
}

impl HttpIdentityGateway {
    /// Create a new gateway.
    ///
    /// # Arguments
    /// * `api_url` - The provider project API URL (e.g., `https://xyz.example.co`)
    /// * `publishable_key` - The provider's publishable (anonymous) API key
    pub fn new(api_url: impl Into<String>, publishable_key: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            api_url: api_url.into(),
            publishable_key: publishable_key.into(),
            callback_port: DEFAULT_CALLBACK_PORT,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            inner: Mutex::new(GatewayInner::default()),
        }
    }

    /// Override the loopback callback settings used by the social flow.
    pub fn with_callback(mut self, port: u16, timeout_secs: u64) -> Self {
        self.callback_port = port;
        self.callback_timeout_secs = timeout_secs;
        self
    }

    /// Build the auth API URL for an endpoint.
    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.api_url, endpoint)
    }

    /// The authorize URL the host application should open in a browser for
    /// a social sign-in.
    pub fn authorize_url(&self, provider: SocialProvider) -> String {
        let callback =
            OAuthCallbackServer::new(self.callback_port, self.callback_timeout_secs).callback_url();
        format!(
            "{}?provider={}&redirect_to={}",
            self.auth_url("authorize"),
            provider.as_str(),
            percent_encode(&callback)
        )
    }

    /// Store a fresh session and notify subscribers of the sign-in.
    fn store_session(&self, data: TokenResponse, force_anonymous: bool) -> ProviderIdentity {
        let expires_at = Utc::now() + Duration::seconds(data.expires_in);
        let mut identity = data.user.into_identity();
        if force_anonymous {
            // Some deployments omit the flag on guest signups.
            identity.is_anonymous = true;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.tokens = Some(TokenSet {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at,
        });
        inner.identity = Some(identity.clone());
        inner.emit(&Some(identity.clone()));
        identity
    }

    /// Convert a non-2xx response into a typed error.
    async fn reject(response: reqwest::Response, context: &str) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "{} failed", context);

        if status.as_u16() == 429 {
            ProviderError::RateLimited(format!("HTTP {}: {}", status, body))
        } else {
            ProviderError::Rejected(format!("{}: HTTP {}: {}", context, status, body))
        }
    }

    /// POST a token grant and parse the session payload.
    async fn request_token(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> ProviderResult<reqwest::Response> {
        let url = format!("{}?grant_type={}", self.auth_url("token"), grant_type);
        debug!(url = %url, "Requesting token grant");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        Ok(response)
    }

    fn access_token(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.tokens.as_ref().map(|t| t.access_token.clone())
    }
}

impl IdentityGateway for HttpIdentityGateway {
    async fn sign_in_with_provider(
        &self,
        provider: SocialProvider,
    ) -> ProviderResult<ProviderIdentity> {
        let server = OAuthCallbackServer::new(self.callback_port, self.callback_timeout_secs);
        let authorize_url = self.authorize_url(provider);

        info!(
            provider = provider.as_str(),
            url = %authorize_url,
            "Waiting for browser sign-in; open the authorize URL to continue"
        );

        let outcome = server.wait_for_callback().await?;

        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "unknown callback error".to_string());
            return Err(ProviderError::OAuth(message));
        }

        let access_token = outcome
            .access_token
            .ok_or_else(|| ProviderError::OAuth("Callback missing access token".to_string()))?;
        let refresh_token = outcome
            .refresh_token
            .ok_or_else(|| ProviderError::OAuth("Callback missing refresh token".to_string()))?;

        // The redirect carries tokens only; the identity comes from the
        // user endpoint.
        let user_url = self.auth_url("user");
        let response = self
            .http_client
            .get(&user_url)
            .header("apikey", &self.publishable_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Social sign-in user lookup").await);
        }

        let user: UserPayload = response.json().await?;
        let identity = self.store_session(
            TokenResponse {
                access_token,
                refresh_token,
                expires_in: outcome.expires_in.unwrap_or(3600),
                user,
            },
            false,
        );

        info!(subject_id = %identity.subject_id, provider = provider.as_str(), "Social sign-in complete");
        Ok(identity)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> ProviderResult<ProviderIdentity> {
        debug!(email = %email, "Attempting email/password sign-in");

        let response = self
            .request_token(
                "password",
                serde_json::json!({ "email": email, "password": password }),
            )
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Password sign-in failed");
            return Err(ProviderError::InvalidCredentials(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let data: TokenResponse = response.json().await?;
        let identity = self.store_session(data, false);

        info!(subject_id = %identity.subject_id, "Password sign-in complete");
        Ok(identity)
    }

    async fn sign_up_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> ProviderResult<ProviderIdentity> {
        let url = self.auth_url("signup");
        debug!(url = %url, email = %email, "Creating identity");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Signup").await);
        }

        let data: TokenResponse = response.json().await?;
        let identity = self.store_session(data, false);

        info!(subject_id = %identity.subject_id, "Signup complete");
        Ok(identity)
    }

    async fn send_password_reset(&self, email: &str) -> ProviderResult<()> {
        let url = self.auth_url("recover");
        debug!(url = %url, "Sending password reset email");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Password reset").await);
        }

        info!("Password reset email sent");
        Ok(())
    }

    async fn send_sign_in_link(&self, email: &str, continue_url: &str) -> ProviderResult<()> {
        let url = self.auth_url("magiclink");
        debug!(url = %url, "Sending sign-in link");

        let response = self
            .http_client
            .post(&url)
            .query(&[("redirect_to", continue_url)])
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Sign-in link").await);
        }

        info!("Sign-in link sent");
        Ok(())
    }

    fn is_sign_in_link(&self, link: &str) -> bool {
        let Ok(parsed) = Url::parse(link) else {
            return false;
        };

        let mut has_token = false;
        let mut is_magiclink = false;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "token" if !value.is_empty() => has_token = true,
                "type" if value == "magiclink" => is_magiclink = true,
                _ => {}
            }
        }
        has_token && is_magiclink
    }

    async fn complete_sign_in_with_link(
        &self,
        email: &str,
        link: &str,
    ) -> ProviderResult<ProviderIdentity> {
        let parsed = Url::parse(link)?;
        let token = parsed
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| {
                ProviderError::InvalidSignInLink("link carries no token".to_string())
            })?;

        let url = self.auth_url("verify");
        debug!(url = %url, "Completing sign-in link");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "type": "magiclink",
                "email": email,
                "token": token,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Sign-in link completion").await);
        }

        let data: TokenResponse = response.json().await?;
        let identity = self.store_session(data, false);

        info!(subject_id = %identity.subject_id, "Sign-in link completed");
        Ok(identity)
    }

    async fn sign_in_anonymously(&self) -> ProviderResult<ProviderIdentity> {
        let url = self.auth_url("signup");
        debug!(url = %url, "Signing in anonymously");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Anonymous sign-in").await);
        }

        let data: TokenResponse = response.json().await?;
        let identity = self.store_session(data, true);

        info!(subject_id = %identity.subject_id, "Anonymous sign-in complete");
        Ok(identity)
    }

    async fn send_verification_email(&self) -> ProviderResult<()> {
        let email = {
            let inner = self.inner.lock().unwrap();
            inner
                .identity
                .as_ref()
                .and_then(|identity| identity.email.clone())
                .ok_or(ProviderError::NotSignedIn)?
        };

        let url = self.auth_url("resend");
        debug!(url = %url, "Requesting verification email");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.publishable_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "type": "signup", "email": email }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Verification email").await);
        }

        info!("Verification email sent");
        Ok(())
    }

    async fn reload_identity(&self) -> ProviderResult<Option<ProviderIdentity>> {
        let Some(access_token) = self.access_token() else {
            return Ok(None);
        };

        let url = self.auth_url("user");
        debug!(url = %url, "Reloading identity");

        let response = self
            .http_client
            .get(&url)
            .header("apikey", &self.publishable_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::reject(response, "Identity reload").await);
        }

        let user: UserPayload = response.json().await?;
        let identity = user.into_identity();

        let mut inner = self.inner.lock().unwrap();
        inner.identity = Some(identity.clone());

        debug!(subject_id = %identity.subject_id, email_verified = identity.email_verified, "Identity reloaded");
        Ok(Some(identity))
    }

    async fn proof_token(&self, force_refresh: bool) -> ProviderResult<String> {
        let tokens = {
            let inner = self.inner.lock().unwrap();
            inner.tokens.clone().ok_or(ProviderError::NotSignedIn)?
        };

        if !force_refresh && !tokens.is_expired() {
            debug!("Proof token still valid");
            return Ok(tokens.access_token);
        }

        debug!("Refreshing proof token");
        let response = self
            .request_token(
                "refresh_token",
                serde_json::json!({ "refresh_token": tokens.refresh_token }),
            )
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Proof token refresh failed");
            return Err(ProviderError::TokenRefresh(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let data: TokenResponse = response.json().await?;
        let expires_at = Utc::now() + Duration::seconds(data.expires_in);
        let access_token = data.access_token.clone();

        // Token refresh keeps the same principal; update tokens without
        // emitting a change notification.
        let mut inner = self.inner.lock().unwrap();
        inner.tokens = Some(TokenSet {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at,
        });

        Ok(access_token)
    }

    async fn sign_out(&self) -> ProviderResult<()> {
        let access_token = self.access_token();

        // Clear local state before the network call so a failed remote
        // sign-out can never leave a stale signed-in identity behind.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.tokens = None;
            inner.identity = None;
            inner.emit(&None);
        }

        if let Some(token) = access_token {
            let url = self.auth_url("logout");
            debug!(url = %url, "Signing out of provider");

            let response = self
                .http_client
                .post(&url)
                .header("apikey", &self.publishable_key)
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(Self::reject(response, "Sign-out").await);
            }
        }

        info!("Signed out of provider");
        Ok(())
    }

    fn current_identity(&self) -> Option<ProviderIdentity> {
        self.inner.lock().unwrap().identity.clone()
    }

    fn subscribe(&self) -> IdentityEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();

        // Contract: the current identity is delivered immediately.
        let _ = tx.send(inner.identity.clone());
        inner.subscribers.push(tx);
        rx
    }
}
