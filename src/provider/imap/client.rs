//! IMAP connection: TLS setup, authentication and the raw commands the
//! adapter needs.

use std::collections::HashSet;
use std::sync::Arc;

use async_imap::types::{Mailbox, Name};
use futures::{AsyncRead, AsyncWrite, StreamExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::parser::{MessageFlags, parse_fetch};
use crate::auth::{AccessToken, TokenKind};
use crate::config::ImapConfig;
use crate::constants::IMAP_FETCH_BATCH_SIZE;
use crate::error::{SyncError, SyncResult};
use crate::model::{Folder, MailItem};

pub(crate) trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> ImapStream for T {}

pub(crate) type ImapSession = async_imap::Session<Box<dyn ImapStream>>;

/// XOAUTH2 authenticator for IMAP
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // XOAUTH2 format: "user=" + user + "\x01auth=Bearer " + token + "\x01\x01"
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.access_token)
    }
}

fn tls_connector() -> SyncResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SyncError::Protocol(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub(crate) struct ImapConnection {
    session: ImapSession,
    has_uidplus: bool,
    has_condstore: bool,
    has_move: bool,
    selected: Option<String>,
}

impl ImapConnection {
    pub async fn connect(config: &ImapConfig, user: &str, token: &AccessToken) -> SyncResult<Self> {
        let addr = format!("{}:{}", config.server, config.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;

        let stream: Box<dyn ImapStream> = if config.tls {
            let server_name = ServerName::try_from(config.server.clone())
                .map_err(|e| SyncError::Protocol(format!("Invalid server name {}: {}", config.server, e)))?;
            let tls = tls_connector()?
                .connect(server_name, tcp)
                .await
                .map_err(|e| SyncError::Transport(format!("TLS handshake failed: {}", e)))?;
            Box::new(tls.compat())
        } else {
            tracing::warn!("IMAP TLS disabled for {}", config.server);
            Box::new(tcp.compat())
        };

        let client = async_imap::Client::new(stream);
        let mut session = match token.kind {
            TokenKind::Password => client
                .login(user, &token.token)
                .await
                .map_err(|(e, _)| login_error(e))?,
            TokenKind::Bearer => {
                let authenticator = XOAuth2 {
                    user: user.to_string(),
                    access_token: token.token.clone(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|(e, _)| login_error(e))?
            }
        };

        let caps = session.capabilities().await?;
        let connection = Self {
            has_uidplus: caps.has_str("UIDPLUS"),
            has_condstore: caps.has_str("CONDSTORE"),
            has_move: caps.has_str("MOVE"),
            session,
            selected: None,
        };
        tracing::info!(
            "Connected to IMAP server {} (condstore: {}, move: {})",
            config.server,
            connection.has_condstore,
            connection.has_move
        );
        Ok(connection)
    }

    pub async fn logout(mut self) {
        self.session.logout().await.ok();
    }

    pub fn has_condstore(&self) -> bool {
        self.has_condstore
    }

    pub async fn list(&mut self) -> SyncResult<Vec<Name>> {
        let names: Vec<_> = self.session.list(Some(""), Some("*")).await?.collect().await;
        names
            .into_iter()
            .map(|r| r.map_err(SyncError::from))
            .collect()
    }

    pub async fn select(&mut self, mailbox: &str) -> SyncResult<Mailbox> {
        let status = if self.has_condstore {
            self.session.select_condstore(mailbox).await?
        } else {
            self.session.select(mailbox).await?
        };
        self.selected = Some(mailbox.to_string());
        Ok(status)
    }

    async fn ensure_selected(&mut self, mailbox: &str) -> SyncResult<()> {
        if self.selected.as_deref() != Some(mailbox) {
            self.select(mailbox).await?;
        }
        Ok(())
    }

    pub async fn search_all_uids(&mut self, mailbox: &str) -> SyncResult<HashSet<u32>> {
        self.ensure_selected(mailbox).await?;
        Ok(self.session.uid_search("ALL").await?)
    }

    /// UIDs and flags of messages whose mod-sequence is above `mod_seq`.
    pub async fn fetch_changed_since(&mut self, mailbox: &str, mod_seq: u64) -> SyncResult<Vec<(u32, MessageFlags)>> {
        self.ensure_selected(mailbox).await?;
        let query = format!("(UID FLAGS) (CHANGEDSINCE {})", mod_seq);
        let fetches: Vec<_> = self.session.uid_fetch("1:*", &query).await?.collect().await;

        let mut changes = Vec::new();
        for fetch in fetches {
            let fetch = fetch?;
            if let Some(uid) = fetch.uid {
                let flags: Vec<_> = fetch.flags().collect();
                changes.push((uid, MessageFlags::from_imap(&flags)));
            }
        }
        Ok(changes)
    }

    pub async fn fetch_headers(&mut self, folder: &Folder, uids: &[u32]) -> SyncResult<Vec<MailItem>> {
        self.ensure_selected(&folder.remote_id).await?;
        let mut items = Vec::with_capacity(uids.len());

        for chunk in uids.chunks(IMAP_FETCH_BATCH_SIZE) {
            let uid_set = uid_set(chunk);
            let fetches: Vec<_> = self
                .session
                .uid_fetch(&uid_set, "(UID FLAGS BODY.PEEK[HEADER] BODY.PEEK[TEXT]<0.200>)")
                .await?
                .collect()
                .await;
            for fetch in fetches {
                let fetch = fetch?;
                match parse_fetch(folder.id, &folder.remote_id, &fetch) {
                    Some(item) => items.push(item),
                    None => tracing::debug!("Skipping unparsable message {:?} in {}", fetch.uid, folder.remote_id),
                }
            }
        }

        tracing::debug!("Fetched {} headers from {}", items.len(), folder.remote_id);
        Ok(items)
    }

    pub async fn store_flag(&mut self, mailbox: &str, uid: u32, flag: &str, add: bool) -> SyncResult<()> {
        self.ensure_selected(mailbox).await?;
        let op = if add { "+FLAGS" } else { "-FLAGS" };
        let responses: Vec<_> = self
            .session
            .uid_store(uid.to_string(), format!("{} ({})", op, flag))
            .await?
            .collect()
            .await;
        for response in responses {
            response?;
        }
        Ok(())
    }

    pub async fn move_message(&mut self, mailbox: &str, uid: u32, target: &str) -> SyncResult<()> {
        self.ensure_selected(mailbox).await?;
        if self.has_move {
            self.session.uid_mv(uid.to_string(), target).await?;
        } else {
            self.session.uid_copy(uid.to_string(), target).await?;
            self.expunge(mailbox, uid).await?;
        }
        Ok(())
    }

    /// Permanently remove one message.
    pub async fn expunge(&mut self, mailbox: &str, uid: u32) -> SyncResult<()> {
        self.store_flag(mailbox, uid, "\\Deleted", true).await?;

        // UID EXPUNGE only removes the specified message, while regular EXPUNGE
        // removes ALL messages with \Deleted flag
        if self.has_uidplus {
            match self.session.run_command_and_check_ok(&format!("UID EXPUNGE {}", uid)).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!("UID EXPUNGE failed: {:?}, falling back to EXPUNGE", e),
            }
        }

        let responses: Vec<_> = self.session.expunge().await?.collect().await;
        for response in responses {
            response?;
        }
        Ok(())
    }

    pub async fn append(&mut self, mailbox: &str, flags: &str, message: &[u8]) -> SyncResult<()> {
        self.session.append(mailbox, Some(flags), None, message).await?;
        Ok(())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> SyncResult<()> {
        self.session.rename(from, to).await?;
        if self.selected.as_deref() == Some(from) {
            self.selected = None;
        }
        Ok(())
    }
}

fn login_error(err: async_imap::error::Error) -> SyncError {
    match err {
        async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
            SyncError::rejected(401, format!("IMAP authentication failed: {}", msg))
        }
        other => SyncError::from(other),
    }
}

/// Compress sorted UIDs into an IMAP sequence set ("1:3,7,9:10").
pub(crate) fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range(start, end));
    parts.join(",")
}

fn range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}
