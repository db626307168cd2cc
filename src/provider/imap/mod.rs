//! IMAP + SMTP adapter.
//!
//! One stateful connection per account, guarded by a mutex. The connection
//! is dropped after any transport failure and re-established on next use.
//!
//! - `client.rs` - connection setup and raw commands
//! - `parser.rs` - FETCH response and flag parsing

mod client;
mod parser;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use self::client::ImapConnection;
use self::parser::{is_selectable, special_from_attributes};
use super::retry::RetryConfig;
use super::smtp::SmtpSender;
use super::{
    Capabilities, FlagUpdate, MailboxStatus, NativeRequest, NativeResponse, ProtocolClient,
    RemoteClient, execute_sequentially, folder_remote_id, unsupported,
};
use crate::auth::Authenticator;
use crate::cache::ChangeProcessor;
use crate::config::{ImapConfig, SmtpConfig};
use crate::error::{SyncError, SyncResult};
use crate::model::{Account, AccountProfile, Folder, MailItem, RemoteFolder, SpecialFolder};
use crate::requests::{MailTarget, PendingRequest, RequestOperation};

/// Run `$body` against a live connection, reconnecting and retrying on
/// transport failures.
macro_rules! with_connection {
    ($self:ident, |$conn:ident| $body:expr) => {{
        let mut delay = $self.retry.initial_delay;
        let mut attempts = 0;
        loop {
            let result = {
                let mut slot = $self.connection.lock().await;
                let result = match $self.ensure_connected(&mut slot).await {
                    Ok($conn) => $body.await,
                    Err(e) => Err(e),
                };
                if matches!(&result, Err(e) if e.is_transient()) {
                    *slot = None;
                }
                result
            };
            match result {
                Err(e) if e.is_transient() && attempts < $self.retry.max_retries => {
                    attempts += 1;
                    tracing::warn!(
                        "IMAP failure for {} (attempt {}/{}): {}. Reconnecting in {:?}...",
                        $self.account.id,
                        attempts,
                        $self.retry.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min($self.retry.max_delay);
                }
                other => break other,
            }
        }
    }};
}

pub struct ImapClient {
    config: ImapConfig,
    account: Account,
    authenticator: Arc<dyn Authenticator>,
    smtp: SmtpSender,
    connection: Mutex<Option<ImapConnection>>,
    retry: RetryConfig,
}

impl ImapClient {
    pub fn new(account: Account, imap: ImapConfig, smtp: SmtpConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            smtp: SmtpSender::new(smtp, account.clone(), authenticator.clone()),
            config: imap,
            account,
            authenticator,
            connection: Mutex::new(None),
            retry: RetryConfig::default(),
        }
    }

    async fn ensure_connected<'a>(&self, slot: &'a mut Option<ImapConnection>) -> SyncResult<&'a mut ImapConnection> {
        let connection = match slot.take() {
            Some(connection) => connection,
            None => {
                let token = self
                    .authenticator
                    .get_token(&self.account)
                    .await
                    .map_err(|e| e.into_sync_error(&self.account.id))?;
                ImapConnection::connect(&self.config, &self.account.address, &token)
                    .await
                    .map_err(|e| match e {
                        SyncError::Rejected { status: 401, .. } => SyncError::AuthenticationRequired {
                            account: self.account.id.clone(),
                        },
                        other => other,
                    })?
            }
        };
        Ok(slot.insert(connection))
    }

    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.logout().await;
        }
    }

    async fn execute_one(&self, request: NativeRequest) -> SyncResult<NativeResponse> {
        match request {
            NativeRequest::StoreFlags { mailbox, uid, flag, add } => {
                with_connection!(self, |conn| conn.store_flag(&mailbox, uid, flag, add))?;
            }
            NativeRequest::MoveMessage { mailbox, uid, target } => {
                with_connection!(self, |conn| conn.move_message(&mailbox, uid, &target))?;
            }
            NativeRequest::Expunge { mailbox, uid } => {
                with_connection!(self, |conn| conn.expunge(&mailbox, uid))?;
            }
            NativeRequest::Append { mailbox, flags, message } => {
                with_connection!(self, |conn| conn.append(&mailbox, flags, &message))?;
            }
            NativeRequest::RenameMailbox { from, to } => {
                with_connection!(self, |conn| conn.rename(&from, &to))?;
            }
            NativeRequest::Submit {
                from,
                recipients,
                message,
                sent_mailbox,
            } => {
                self.smtp.send_raw(&from, &recipients, &message).await?;
                if let Some(sent) = sent_mailbox
                    && let Err(e) = with_connection!(self, |conn| conn.append(&sent, "(\\Seen)", &message))
                {
                    // The message is already out; only the sent copy is missing
                    tracing::warn!("Failed to store sent copy in {}: {}", sent, e);
                }
            }
            other => return Err(SyncError::rejected(400, format!("{:?} has no IMAP form", other))),
        }
        Ok(NativeResponse::default())
    }

    async fn special_folder_remote_id(&self, lookup: &dyn ChangeProcessor, special: SpecialFolder) -> SyncResult<Option<String>> {
        Ok(lookup
            .get_special_folder(&self.account.id, special)
            .await?
            .map(|f| f.remote_id))
    }
}

/// Mailbox and UID of a message; both are required by every IMAP command.
async fn locate(lookup: &dyn ChangeProcessor, target: &MailTarget) -> SyncResult<(String, u32)> {
    let (Some(folder_id), Some(uid)) = (target.folder_id, target.uid) else {
        return Err(SyncError::rejected(
            400,
            format!("{} has no IMAP location", target.mail_id),
        ));
    };
    Ok((folder_remote_id(lookup, folder_id).await?, uid))
}

async fn store(lookup: &dyn ChangeProcessor, target: &MailTarget, flag: &'static str, add: bool) -> SyncResult<NativeRequest> {
    let (mailbox, uid) = locate(lookup, target).await?;
    Ok(NativeRequest::StoreFlags { mailbox, uid, flag, add })
}

/// Full mailbox name after renaming the leaf of `folder`.
fn renamed_mailbox(folder: &Folder, name: &str) -> String {
    match &folder.parent_remote_id {
        Some(parent) => {
            let delimiter = folder.remote_id[parent.len()..].chars().next().unwrap_or('/');
            format!("{}{}{}", parent, delimiter, name)
        }
        None => name.to_string(),
    }
}

#[async_trait]
impl RemoteClient for ImapClient {
    fn capabilities(&self) -> Capabilities {
        Capabilities { batch_size: None }
    }

    async fn fetch_profile(&self) -> SyncResult<AccountProfile> {
        Ok(AccountProfile {
            address: self.account.address.clone(),
            display_name: self.account.display_name.clone(),
        })
    }

    async fn list_folders(&self) -> SyncResult<Vec<RemoteFolder>> {
        let names = with_connection!(self, |conn| conn.list())?;

        let mut folders = Vec::new();
        for name in &names {
            if !is_selectable(name.attributes()) {
                continue;
            }
            let remote_id = name.name().to_string();
            let (parent, leaf) = match name.delimiter().and_then(|d| remote_id.rsplit_once(d)) {
                Some((parent, leaf)) => (Some(parent.to_string()), leaf.to_string()),
                None => (None, remote_id.clone()),
            };
            let special = if remote_id.eq_ignore_ascii_case("INBOX") {
                SpecialFolder::Inbox
            } else {
                special_from_attributes(name.attributes()).unwrap_or_else(|| SpecialFolder::guess_from_name(&remote_id))
            };
            let mut folder = RemoteFolder::new(remote_id, leaf, special);
            if let Some(parent) = parent {
                folder = folder.with_parent(parent);
            }
            folders.push(folder);
        }

        tracing::debug!("Listed {} IMAP folders", folders.len());
        Ok(folders)
    }

    async fn refresh_token(&self) -> SyncResult<()> {
        self.authenticator.invalidate(&self.account).await;
        self.disconnect().await;
        self.authenticator
            .get_token(&self.account)
            .await
            .map(|_| ())
            .map_err(|e| e.into_sync_error(&self.account.id))
    }

    async fn prepare(&self, request: &PendingRequest, lookup: &dyn ChangeProcessor) -> SyncResult<NativeRequest> {
        use RequestOperation::*;
        match &request.operation {
            MarkRead(t) => store(lookup, t, "\\Seen", true).await,
            MarkUnread(t) => store(lookup, t, "\\Seen", false).await,
            Flag(t) => store(lookup, t, "\\Flagged", true).await,
            Unflag(t) => store(lookup, t, "\\Flagged", false).await,
            Move { target, to, .. } => {
                let (mailbox, uid) = locate(lookup, target).await?;
                Ok(NativeRequest::MoveMessage {
                    mailbox,
                    uid,
                    target: folder_remote_id(lookup, *to).await?,
                })
            }
            Delete(t) => {
                let (mailbox, uid) = locate(lookup, t).await?;
                Ok(NativeRequest::Expunge { mailbox, uid })
            }
            CreateDraft(draft) => {
                let mailbox = self
                    .special_folder_remote_id(lookup, SpecialFolder::Draft)
                    .await?
                    .ok_or_else(|| SyncError::rejected(404, "account has no drafts folder"))?;
                Ok(NativeRequest::Append {
                    mailbox,
                    flags: "(\\Draft \\Seen)",
                    message: draft.to_mime().map_err(|e| SyncError::rejected(400, format!("{:#}", e)))?,
                })
            }
            Send(draft) => Ok(NativeRequest::Submit {
                from: draft.from_address.clone(),
                recipients: draft.recipients().cloned().collect(),
                message: draft.to_mime().map_err(|e| SyncError::rejected(400, format!("{:#}", e)))?,
                sent_mailbox: self.special_folder_remote_id(lookup, SpecialFolder::Sent).await?,
            }),
            RenameFolder { folder_id, name } => {
                let folder = lookup
                    .get_folder(*folder_id)
                    .await?
                    .ok_or_else(|| SyncError::rejected(404, format!("folder {} no longer exists", folder_id)))?;
                Ok(NativeRequest::RenameMailbox {
                    to: renamed_mailbox(&folder, name),
                    from: folder.remote_id,
                })
            }
            AddLabel { .. } | RemoveLabel { .. } | Rsvp { .. } => Err(unsupported("IMAP", request)),
        }
    }

    async fn execute_batch(&self, requests: Vec<NativeRequest>) -> Vec<SyncResult<NativeResponse>> {
        execute_sequentially(requests, |request| self.execute_one(request)).await
    }
}

#[async_trait]
impl ProtocolClient for ImapClient {
    async fn examine(&self, folder: &Folder) -> SyncResult<MailboxStatus> {
        let mailbox = with_connection!(self, |conn| conn.select(&folder.remote_id))?;
        let uid_validity = mailbox
            .uid_validity
            .ok_or_else(|| SyncError::Protocol(format!("{} reported no UIDVALIDITY", folder.remote_id)))?;
        Ok(MailboxStatus {
            uid_validity,
            uid_next: mailbox.uid_next,
            highest_mod_seq: mailbox.highest_modseq,
        })
    }

    async fn fetch_uids(&self, folder: &Folder) -> SyncResult<Vec<u32>> {
        let uids = with_connection!(self, |conn| conn.search_all_uids(&folder.remote_id))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_changed_since(&self, folder: &Folder, mod_seq: u64) -> SyncResult<Vec<FlagUpdate>> {
        let changes = with_connection!(self, |conn| async {
            if !conn.has_condstore() {
                return Ok(Vec::new());
            }
            conn.fetch_changed_since(&folder.remote_id, mod_seq).await
        })?;
        Ok(changes
            .into_iter()
            .map(|(uid, flags)| FlagUpdate {
                uid,
                state: flags.state(),
            })
            .collect())
    }

    async fn fetch_headers(&self, folder: &Folder, uids: &[u32]) -> SyncResult<Vec<MailItem>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        with_connection!(self, |conn| conn.fetch_headers(folder, uids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Draft, ProviderKind};
    use crate::provider::fake::StaticAuthenticator;
    use crate::requests::target;

    fn client() -> ImapClient {
        let account = Account::new("acc", "me@example.com", ProviderKind::Imap);
        let imap = ImapConfig {
            server: "imap.example.com".to_string(),
            port: 993,
            tls: true,
        };
        let smtp = SmtpConfig {
            server: "smtp.example.com".to_string(),
            port: 587,
            tls: true,
        };
        ImapClient::new(account, imap, smtp, Arc::new(StaticAuthenticator))
    }

    async fn cache() -> crate::cache::Cache {
        let cache = crate::cache::Cache::open_in_memory().await.unwrap();
        cache
            .ensure_account(&Account::new("acc", "me@example.com", ProviderKind::Imap))
            .await
            .unwrap();
        cache
            .upsert_folders(
                "acc",
                &[
                    RemoteFolder::new("INBOX", "INBOX", SpecialFolder::Inbox),
                    RemoteFolder::new("Sent", "Sent", SpecialFolder::Sent),
                    RemoteFolder::new("Work", "Work", SpecialFolder::Other),
                    RemoteFolder::new("Work/Old", "Old", SpecialFolder::Other).with_parent("Work"),
                ],
            )
            .await
            .unwrap();
        cache
    }

    async fn folder(cache: &crate::cache::Cache, remote: &str) -> Folder {
        cache.get_folder_by_remote_id("acc", remote).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_prepare_flag_store() {
        let (client, cache) = (client(), cache().await);
        let inbox = folder(&cache, "INBOX").await;
        let mut t = target("x", Some(inbox.id));
        t.uid = Some(42);
        let req = PendingRequest::new("acc", RequestOperation::MarkUnread(t));
        assert_eq!(
            client.prepare(&req, &cache).await.unwrap(),
            NativeRequest::StoreFlags {
                mailbox: "INBOX".to_string(),
                uid: 42,
                flag: "\\Seen",
                add: false,
            }
        );
    }

    #[tokio::test]
    async fn test_prepare_requires_uid() {
        let (client, cache) = (client(), cache().await);
        let req = PendingRequest::new("acc", RequestOperation::Flag(target("x", None)));
        assert!(matches!(
            client.prepare(&req, &cache).await,
            Err(SyncError::Rejected { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_prepare_send_targets_sent_folder() {
        let (client, cache) = (client(), cache().await);
        let draft = Draft {
            local_id: "l1".to_string(),
            from_address: "me@example.com".to_string(),
            to: vec!["a@example.com".to_string()],
            cc: vec!["b@example.com".to_string()],
            ..Default::default()
        };
        let req = PendingRequest::new("acc", RequestOperation::Send(draft));
        match client.prepare(&req, &cache).await.unwrap() {
            NativeRequest::Submit {
                recipients,
                sent_mailbox,
                ..
            } => {
                assert_eq!(recipients.len(), 2);
                assert_eq!(sent_mailbox.as_deref(), Some("Sent"));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rename_keeps_parent_path() {
        let cache = cache().await;
        let nested = folder(&cache, "Work/Old").await;
        assert_eq!(renamed_mailbox(&nested, "Archive 2023"), "Work/Archive 2023");
        let top = folder(&cache, "Work").await;
        assert_eq!(renamed_mailbox(&top, "Jobs"), "Jobs");
    }
}
