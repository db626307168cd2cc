//! Access-token acquisition for provider adapters.
//!
//! Adapters never talk to a token endpoint themselves; they ask an
//! [`Authenticator`] and call [`Authenticator::invalidate`] after a 401.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;

use crate::constants::TOKEN_EXPIRY_SKEW_SECS;
use crate::credentials::CredentialStore;
use crate::error::AuthError;
use crate::model::{Account, ProviderKind};

const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MICROSOFT_SCOPE: &str = "offline_access https://graph.microsoft.com/.default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// OAuth2 bearer token (HTTP Authorization header, IMAP/SMTP XOAUTH2)
    Bearer,
    /// Plain password for IMAP LOGIN / SMTP AUTH
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub kind: TokenKind,
    /// Unix timestamp
    pub expires_at: i64,
}

impl AccessToken {
    pub fn bearer(token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            token: token.into(),
            kind: TokenKind::Bearer,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now + TOKEN_EXPIRY_SKEW_SECS >= self.expires_at
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn get_token(&self, account: &Account) -> Result<AccessToken, AuthError>;

    /// Drop any cached token so the next `get_token` goes to the server.
    async fn invalidate(&self, account: &Account);
}

/// Build the XOAUTH2 SASL authentication string
///
/// Format: base64("user=" + email + "\x01auth=Bearer " + access_token + "\x01\x01")
pub fn build_xoauth2_string(email: &str, access_token: &str) -> String {
    let auth_string = format!("user={}\x01auth=Bearer {}\x01\x01", email, access_token);
    base64::engine::general_purpose::STANDARD.encode(auth_string)
}

/// Hands out the stored password. Never expires.
pub struct PasswordAuthenticator {
    credentials: CredentialStore,
}

impl PasswordAuthenticator {
    pub fn new(credentials: CredentialStore) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn get_token(&self, _account: &Account) -> Result<AccessToken, AuthError> {
        let password = self
            .credentials
            .get_password()
            .map_err(|e| AuthError::InteractionRequired(e.to_string()))?;
        Ok(AccessToken {
            token: password,
            kind: TokenKind::Password,
            expires_at: i64::MAX,
        })
    }

    async fn invalidate(&self, _account: &Account) {}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Evicts each token `TOKEN_EXPIRY_SKEW_SECS` before it actually expires.
struct TokenExpiry;

impl moka::Expiry<String, AccessToken> for TokenExpiry {
    fn expire_after_create(&self, _key: &String, value: &AccessToken, _created_at: Instant) -> Option<Duration> {
        let remaining = value.expires_at - Utc::now().timestamp() - TOKEN_EXPIRY_SKEW_SECS;
        Some(Duration::from_secs(remaining.max(0) as u64))
    }
}

/// Refresh-token flow against the provider's token endpoint.
pub struct OAuth2Authenticator {
    client_id: String,
    client_secret: Option<String>,
    token_url: &'static str,
    scope: Option<&'static str>,
    credentials: CredentialStore,
    http: reqwest::Client,
    tokens: moka::future::Cache<String, AccessToken>,
}

impl OAuth2Authenticator {
    pub fn new(
        account: &Account,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        credentials: CredentialStore,
    ) -> anyhow::Result<Self> {
        let (token_url, scope) = token_endpoint(account);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client_id: client_id.into(),
            client_secret,
            token_url,
            scope,
            credentials,
            http,
            tokens: moka::future::Cache::builder()
                .max_capacity(64)
                .expire_after(TokenExpiry)
                .build(),
        })
    }

    async fn refresh(&self, account: &Account) -> Result<AccessToken, AuthError> {
        let refresh_token = self
            .credentials
            .get_oauth2_refresh_token()
            .map_err(|e| AuthError::InteractionRequired(e.to_string()))?;

        let mut params = vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }
        if let Some(scope) = self.scope {
            params.push(("scope", scope));
        }

        let response = self
            .http
            .post(self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Failed(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error: TokenErrorResponse = response.json().await.unwrap_or(TokenErrorResponse {
                error: "unknown_error".to_string(),
                error_description: None,
            });
            let detail = error.error_description.unwrap_or_else(|| error.error.clone());
            return Err(classify_token_error(status.as_u16(), &error.error, detail));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Failed(format!("malformed token response: {}", e)))?;

        if let Some(rotated) = tokens.refresh_token.as_deref()
            && rotated != refresh_token
            && let Err(e) = self.credentials.set_oauth2_refresh_token(rotated)
        {
            tracing::warn!("Failed to persist rotated refresh token for {}: {}", account.id, e);
        }

        tracing::debug!("Refreshed access token for {}", account.id);
        let expires_at = Utc::now().timestamp() + tokens.expires_in.unwrap_or(3600);
        Ok(AccessToken::bearer(tokens.access_token, expires_at))
    }
}

#[async_trait]
impl Authenticator for OAuth2Authenticator {
    async fn get_token(&self, account: &Account) -> Result<AccessToken, AuthError> {
        self.tokens
            .try_get_with(account.id.clone(), self.refresh(account))
            .await
            .map_err(|e: Arc<AuthError>| (*e).clone())
    }

    async fn invalidate(&self, account: &Account) {
        self.tokens.invalidate(&account.id).await;
    }
}

fn token_endpoint(account: &Account) -> (&'static str, Option<&'static str>) {
    let google = account.address.ends_with("@gmail.com") || account.address.ends_with("@googlemail.com");
    match account.provider {
        ProviderKind::Gmail => (GOOGLE_TOKEN_URL, None),
        ProviderKind::Imap if google => (GOOGLE_TOKEN_URL, None),
        ProviderKind::Outlook | ProviderKind::Imap => (MICROSOFT_TOKEN_URL, Some(MICROSOFT_SCOPE)),
    }
}

/// `invalid_grant` and friends mean the refresh token is dead; anything else may be retried.
fn classify_token_error(status: u16, code: &str, detail: String) -> AuthError {
    match code {
        "invalid_grant" | "interaction_required" | "consent_required" | "invalid_client" => {
            AuthError::InteractionRequired(detail)
        }
        _ if (400..500).contains(&status) && status != 429 => AuthError::InteractionRequired(detail),
        _ => AuthError::Failed(format!("token refresh failed ({}): {}", status, detail)),
    }
}
