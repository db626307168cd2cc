use std::sync::Arc;

use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use crate::auth::{Authenticator, TokenKind};
use crate::config::SmtpConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::Account;

/// Implicit-TLS submission port; every other port negotiates STARTTLS.
const SMTPS_PORT: u16 = 465;

/// Outgoing mail for the protocol provider.
pub struct SmtpSender {
    config: SmtpConfig,
    account: Account,
    authenticator: Arc<dyn Authenticator>,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig, account: Account, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            account,
            authenticator,
        }
    }

    /// Credentials are fetched per send so refreshed OAuth2 tokens are picked up.
    async fn transport(&self) -> SyncResult<AsyncSmtpTransport<Tokio1Executor>> {
        let token = self
            .authenticator
            .get_token(&self.account)
            .await
            .map_err(|e| e.into_sync_error(&self.account.id))?;

        let mechanisms = match token.kind {
            TokenKind::Password => vec![Mechanism::Plain, Mechanism::Login],
            TokenKind::Bearer => vec![Mechanism::Xoauth2],
        };
        let creds = Credentials::new(self.account.address.clone(), token.token);

        // Always require TLS - plaintext SMTP exposes credentials
        if !self.config.tls {
            tracing::warn!("SMTP TLS disabled in config - enabling anyway for security");
        }

        let builder = if self.config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.server)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.server)?
        };

        Ok(builder
            .port(self.config.port)
            .credentials(creds)
            .authentication(mechanisms)
            .build())
    }

    pub async fn send_raw(&self, from: &str, recipients: &[String], message: &[u8]) -> SyncResult<()> {
        let envelope = envelope(from, recipients)?;
        let transport = self.transport().await?;
        transport.send_raw(&envelope, message).await?;
        tracing::info!("Message submitted to {} recipients", recipients.len());
        Ok(())
    }
}

fn envelope(from: &str, recipients: &[String]) -> SyncResult<Envelope> {
    let from: Address = from
        .parse()
        .map_err(|_| SyncError::rejected(400, format!("Invalid from address: {}", from)))?;
    let to = recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .map(|r| {
            r.parse::<Address>()
                .map_err(|_| SyncError::rejected(400, format!("Invalid recipient address: {}", r)))
        })
        .collect::<SyncResult<Vec<_>>>()?;
    Envelope::new(Some(from), to).map_err(|e| SyncError::rejected(400, e.to_string()))
}
