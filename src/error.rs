//! Error taxonomy shared by provider adapters, synchronizers and the request pipeline.

use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The authenticator needs the user to sign in again. Never retried internally.
    #[error("account {account} needs interactive re-authentication")]
    AuthenticationRequired { account: String },

    /// The provider invalidated the stored cursor (HTTP 410 / expired history id).
    #[error("synchronization cursor expired")]
    CursorExpired,

    /// HTTP 429; carries the raw Retry-After header value if the server sent one.
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<String> },

    /// Connection, timeout or 5xx failure. Retried at the adapter layer.
    #[error("transport error: {0}")]
    Transport(String),

    /// Definitive provider error for a request.
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("{failed} of {total} batched requests failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("operation canceled")]
    Canceled,

    /// Malformed server data or an unexpected protocol state.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        SyncError::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Failures the adapter may retry without involving the recovery chain.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_))
    }

    /// Copy of this error for fanning one batch-level failure out to every
    /// request in the batch. Storage errors keep only their message.
    pub fn duplicate(&self) -> SyncError {
        match self {
            SyncError::AuthenticationRequired { account } => SyncError::AuthenticationRequired {
                account: account.clone(),
            },
            SyncError::CursorExpired => SyncError::CursorExpired,
            SyncError::RateLimited { retry_after } => SyncError::RateLimited {
                retry_after: retry_after.clone(),
            },
            SyncError::Transport(msg) => SyncError::Transport(msg.clone()),
            SyncError::Rejected { status, message } => SyncError::rejected(*status, message.clone()),
            SyncError::PartialBatchFailure { failed, total } => SyncError::PartialBatchFailure {
                failed: *failed,
                total: *total,
            },
            SyncError::Canceled => SyncError::Canceled,
            SyncError::Protocol(msg) => SyncError::Protocol(msg.clone()),
            SyncError::Storage(e) => SyncError::Storage(anyhow::anyhow!("{:#}", e)),
        }
    }

    /// Errors that are always reported to the caller as-is.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            SyncError::AuthenticationRequired { .. } | SyncError::Rejected { .. }
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Protocol(format!("malformed response: {}", err))
        } else if let Some(status) = err.status() {
            SyncError::rejected(status.as_u16(), err.to_string())
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<async_imap::error::Error> for SyncError {
    fn from(err: async_imap::error::Error) -> Self {
        use async_imap::error::Error;
        match err {
            Error::Io(e) => SyncError::Transport(e.to_string()),
            Error::ConnectionLost => SyncError::Transport("connection lost".to_string()),
            Error::No(msg) => SyncError::rejected(0, format!("NO {}", msg)),
            Error::Bad(msg) => SyncError::rejected(0, format!("BAD {}", msg)),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

impl From<lettre::transport::smtp::Error> for SyncError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        if err.is_permanent() {
            let status = err
                .status()
                .and_then(|code| code.to_string().parse::<u16>().ok())
                .unwrap_or(0);
            SyncError::rejected(status, err.to_string())
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

/// Failure reported by an [`Authenticator`](crate::auth::Authenticator).
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Stored credentials are no longer accepted; the user must sign in.
    #[error("interactive re-authentication required: {0}")]
    InteractionRequired(String),

    #[error("token request failed: {0}")]
    Failed(String),
}

impl AuthError {
    pub fn into_sync_error(self, account: &str) -> SyncError {
        match self {
            AuthError::InteractionRequired(reason) => {
                tracing::warn!("Account {} needs re-authentication: {}", account, reason);
                SyncError::AuthenticationRequired {
                    account: account.to_string(),
                }
            }
            AuthError::Failed(msg) => SyncError::Transport(msg),
        }
    }
}
