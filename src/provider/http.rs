//! Authenticated REST transport shared by the Graph and Gmail adapters.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::retry::{RetryConfig, with_retry};
use crate::auth::Authenticator;
use crate::error::{SyncError, SyncResult};
use crate::model::Account;

const REQUEST_TIMEOUT_SECS: u64 = 60;

pub struct RestTransport {
    http: reqwest::Client,
    base_url: String,
    account: Account,
    authenticator: Arc<dyn Authenticator>,
    retry: RetryConfig,
}

impl RestTransport {
    pub fn new(base_url: impl Into<String>, account: Account, authenticator: Arc<dyn Authenticator>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SyncError::Protocol(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            account,
            authenticator,
            retry: RetryConfig::default(),
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Absolute URLs (next/delta links) pass through untouched.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    pub async fn bearer(&self) -> SyncResult<String> {
        self.authenticator
            .get_token(&self.account)
            .await
            .map(|t| t.token)
            .map_err(|e| e.into_sync_error(&self.account.id))
    }

    pub async fn refresh_token(&self) -> SyncResult<()> {
        self.authenticator.invalidate(&self.account).await;
        self.bearer().await.map(|_| ())
    }

    /// Send with authentication, one token refresh on 401, status
    /// classification and transport retries.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> SyncResult<Response> {
        with_retry(&self.retry, || self.send_once(method.clone(), path, body)).await
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<&Value>) -> SyncResult<Response> {
        let url = self.url(path);
        let mut refreshed = false;

        loop {
            let token = self.bearer().await?;
            let mut request = self.http.request(method.clone(), &url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;

            if response.status() == StatusCode::UNAUTHORIZED {
                if refreshed {
                    tracing::warn!("{} rejected a freshly refreshed token", self.account.id);
                    return Err(SyncError::AuthenticationRequired {
                        account: self.account.id.clone(),
                    });
                }
                tracing::debug!("401 from {}, refreshing token", url);
                self.authenticator.invalidate(&self.account).await;
                refreshed = true;
                continue;
            }

            return check_status(response).await;
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> SyncResult<T> {
        let response = self.send(method, path, body).await?;
        decode_json(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        self.send_json(Method::GET, path, None).await
    }
}

pub async fn decode_json<T: DeserializeOwned>(response: Response) -> SyncResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::Protocol(format!("malformed response: {}", e)))
}

/// Pass successful responses through and map failures onto [`SyncError`].
pub async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), retry_after, &body))
}

/// 401 is handled by the caller since it needs the account.
pub fn classify_status(status: u16, retry_after: Option<String>, body: &str) -> SyncError {
    match status {
        410 => SyncError::CursorExpired,
        429 => SyncError::RateLimited { retry_after },
        408 | 500..=599 => SyncError::Transport(format!("server returned {}: {}", status, error_message(body))),
        _ => SyncError::rejected(status, error_message(body)),
    }
}

/// Both Graph and Gmail report errors as `{"error": {"message": ...}}`.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/error_description"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(410, None, ""), SyncError::CursorExpired));
        assert!(matches!(
            classify_status(429, Some("30".into()), ""),
            SyncError::RateLimited { retry_after: Some(ref v) } if v == "30"
        ));
        assert!(classify_status(503, None, "").is_transient());
        assert!(matches!(
            classify_status(404, None, ""),
            SyncError::Rejected { status: 404, .. }
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"code":"ErrorItemNotFound","message":"The specified object was not found."}}"#;
        assert_eq!(error_message(body), "The specified object was not found.");
        assert_eq!(error_message("plain failure"), "plain failure");
    }
}
