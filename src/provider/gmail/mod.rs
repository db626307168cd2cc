//! Gmail REST adapter.
//!
//! Changes are read from the account-wide history feed. Label changes are
//! merged into `batchModify` calls; everything else is a plain REST call.

mod model;

pub use model::ALL_MAIL_LABEL;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::{Value, json};

use self::model::{
    GmailMessage, HistoryList, LabelList, MessageList, Profile, STARRED_LABEL, UNREAD_LABEL,
    created_package, label_special,
};
use super::http::{RestTransport, decode_json};
use super::{
    Capabilities, HistoryClient, HistoryPage, HttpRequest, MessageIdPage, NativeRequest,
    NativeResponse, RemoteClient, folder_remote_id, unsupported,
};
use crate::auth::Authenticator;
use crate::cache::ChangeProcessor;
use crate::constants::{GMAIL_BATCH_MODIFY_SIZE, GMAIL_PAGE_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::model::{Account, AccountProfile, Draft, NewMailPackage, RemoteFolder, SpecialFolder};
use crate::requests::{MailTarget, PendingRequest, RequestOperation};

const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const METADATA_HEADERS: [&str; 6] = ["From", "Subject", "Date", "Message-ID", "In-Reply-To", "References"];

/// Concurrent message downloads per `get_messages` call.
const DOWNLOAD_CONCURRENCY: usize = 8;

pub struct GmailClient {
    transport: RestTransport,
}

impl GmailClient {
    pub fn new(account: Account, authenticator: Arc<dyn Authenticator>) -> SyncResult<Self> {
        Ok(Self {
            transport: RestTransport::new(GMAIL_BASE_URL, account, authenticator)?,
        })
    }

    async fn profile(&self) -> SyncResult<Profile> {
        self.transport.get_json("/profile").await
    }

    async fn get_message(&self, id: &str) -> SyncResult<NewMailPackage> {
        let headers: String = METADATA_HEADERS
            .iter()
            .map(|h| format!("&metadataHeaders={}", h))
            .collect();
        let path = format!("/messages/{}?format=metadata{}", id, headers);
        let message: GmailMessage = self.transport.get_json(&path).await?;
        Ok(message.into_package())
    }

    async fn execute_one(&self, request: &NativeRequest) -> SyncResult<NativeResponse> {
        match request {
            NativeRequest::Http(http) => {
                let response = self
                    .transport
                    .send(http.method.clone(), &http.path, http.body.as_ref())
                    .await?;
                let Some(template) = &http.created else {
                    return Ok(NativeResponse::default());
                };
                let resource: Value = decode_json(response).await?;
                Ok(NativeResponse {
                    created: Some(created_package(template, &resource)?),
                    replaces: None,
                })
            }
            NativeRequest::ModifyLabels { ids, add, remove } => {
                self.batch_modify(ids, add, remove).await?;
                Ok(NativeResponse::default())
            }
            _ => Err(SyncError::rejected(400, "request has no Gmail form")),
        }
    }

    async fn batch_modify(&self, ids: &[String], add: &[String], remove: &[String]) -> SyncResult<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        for chunk in ids.chunks(GMAIL_BATCH_MODIFY_SIZE) {
            let body = json!({
                "ids": chunk,
                "addLabelIds": add,
                "removeLabelIds": remove,
            });
            self.transport
                .send(Method::POST, "/messages/batchModify", Some(&body))
                .await?;
            tracing::debug!("batchModify of {} messages (+{:?} -{:?})", chunk.len(), add, remove);
        }
        Ok(())
    }
}

fn modify(target: &MailTarget, add: &[&str], remove: &[&str]) -> NativeRequest {
    NativeRequest::ModifyLabels {
        ids: vec![target.remote_id.clone()],
        add: add.iter().map(|s| s.to_string()).collect(),
        remove: remove.iter().map(|s| s.to_string()).collect(),
    }
}

/// Labels that exist on the server; the virtual All Mail folder does not.
fn real_label(label: String) -> Vec<String> {
    if label == ALL_MAIL_LABEL { Vec::new() } else { vec![label] }
}

fn raw_message(draft: &Draft) -> SyncResult<Value> {
    let mime = draft.to_mime().map_err(|e| SyncError::rejected(400, format!("{:#}", e)))?;
    let mut message = json!({
        "raw": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mime),
    });
    if let Some(thread_id) = &draft.thread_id {
        message["threadId"] = json!(thread_id);
    }
    Ok(message)
}

struct LabelGroup {
    indices: Vec<usize>,
    ids: Vec<String>,
    add: Vec<String>,
    remove: Vec<String>,
}

/// Group identical label changes so each group becomes one `batchModify` call.
fn group_label_changes(requests: &[NativeRequest]) -> Vec<LabelGroup> {
    let mut groups: Vec<LabelGroup> = Vec::new();
    for (index, request) in requests.iter().enumerate() {
        let NativeRequest::ModifyLabels { ids, add, remove } = request else {
            continue;
        };
        let mut add = add.clone();
        let mut remove = remove.clone();
        add.sort();
        remove.sort();
        match groups.iter_mut().find(|g| g.add == add && g.remove == remove) {
            Some(group) => {
                group.indices.push(index);
                group.ids.extend(ids.iter().cloned());
            }
            None => groups.push(LabelGroup {
                indices: vec![index],
                ids: ids.clone(),
                add,
                remove,
            }),
        }
    }
    groups
}

#[async_trait]
impl RemoteClient for GmailClient {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            batch_size: Some(GMAIL_BATCH_MODIFY_SIZE),
        }
    }

    async fn fetch_profile(&self) -> SyncResult<AccountProfile> {
        let profile = self.profile().await?;
        Ok(AccountProfile {
            address: profile.email_address,
            display_name: None,
        })
    }

    async fn list_folders(&self) -> SyncResult<Vec<RemoteFolder>> {
        let list: LabelList = self.transport.get_json("/labels").await?;
        let ids_by_name: HashMap<&str, &str> = list
            .labels
            .iter()
            .map(|l| (l.name.as_str(), l.id.as_str()))
            .collect();

        let mut folders = Vec::new();
        for label in &list.labels {
            let Some(special) = label_special(&label.id) else {
                continue;
            };
            let mut folder = RemoteFolder::new(label.id.clone(), label.name.clone(), special);
            // Nested user labels are named "Parent/Child"
            if let Some((parent, _)) = label.name.rsplit_once('/')
                && let Some(parent_id) = ids_by_name.get(parent)
            {
                folder = folder.with_parent(*parent_id);
            }
            folders.push(folder);
        }
        folders.push(RemoteFolder::new(ALL_MAIL_LABEL, "All Mail", SpecialFolder::Archive));

        tracing::debug!("Listed {} Gmail labels", folders.len());
        Ok(folders)
    }

    async fn refresh_token(&self) -> SyncResult<()> {
        self.transport.refresh_token().await
    }

    async fn prepare(&self, request: &PendingRequest, lookup: &dyn ChangeProcessor) -> SyncResult<NativeRequest> {
        use RequestOperation::*;
        let native = match &request.operation {
            MarkRead(t) => modify(t, &[], &[UNREAD_LABEL]),
            MarkUnread(t) => modify(t, &[UNREAD_LABEL], &[]),
            Flag(t) => modify(t, &[STARRED_LABEL], &[]),
            Unflag(t) => modify(t, &[], &[STARRED_LABEL]),
            Move { target, from, to } => {
                let destination = lookup
                    .get_folder(*to)
                    .await?
                    .ok_or_else(|| SyncError::rejected(404, format!("folder {} no longer exists", to)))?;
                if destination.special == SpecialFolder::Trash {
                    NativeRequest::Http(HttpRequest::new(
                        Method::POST,
                        format!("/messages/{}/trash", target.remote_id),
                    ))
                } else {
                    let source = folder_remote_id(lookup, *from).await?;
                    NativeRequest::ModifyLabels {
                        ids: vec![target.remote_id.clone()],
                        add: real_label(destination.remote_id),
                        remove: real_label(source),
                    }
                }
            }
            AddLabel { target, folder } => NativeRequest::ModifyLabels {
                ids: vec![target.remote_id.clone()],
                add: real_label(folder_remote_id(lookup, *folder).await?),
                remove: Vec::new(),
            },
            RemoveLabel { target, folder } => NativeRequest::ModifyLabels {
                ids: vec![target.remote_id.clone()],
                add: Vec::new(),
                remove: real_label(folder_remote_id(lookup, *folder).await?),
            },
            Delete(t) => NativeRequest::Http(HttpRequest::new(Method::DELETE, format!("/messages/{}", t.remote_id))),
            CreateDraft(draft) => NativeRequest::Http(
                HttpRequest::new(Method::POST, "/drafts")
                    .json(json!({ "message": raw_message(draft)? }))
                    .creating(draft.to_mail_item(true)),
            ),
            Send(draft) => NativeRequest::Http(
                HttpRequest::new(Method::POST, "/messages/send")
                    .json(raw_message(draft)?)
                    .creating(draft.to_mail_item(false)),
            ),
            RenameFolder { folder_id, name } => {
                let remote = folder_remote_id(lookup, *folder_id).await?;
                if remote == ALL_MAIL_LABEL {
                    return Err(SyncError::rejected(400, "All Mail cannot be renamed"));
                }
                NativeRequest::Http(
                    HttpRequest::new(Method::PATCH, format!("/labels/{}", remote)).json(json!({ "name": name })),
                )
            }
            Rsvp { .. } => return Err(unsupported("Gmail", request)),
        };
        Ok(native)
    }

    async fn execute_batch(&self, requests: Vec<NativeRequest>) -> Vec<SyncResult<NativeResponse>> {
        let mut results: Vec<Option<SyncResult<NativeResponse>>> = requests.iter().map(|_| None).collect();

        for group in group_label_changes(&requests) {
            let outcome = self.batch_modify(&group.ids, &group.add, &group.remove).await;
            for index in group.indices {
                results[index] = Some(
                    outcome
                        .as_ref()
                        .map(|_| NativeResponse::default())
                        .map_err(SyncError::duplicate),
                );
            }
        }

        for (index, request) in requests.iter().enumerate() {
            if results[index].is_none() {
                results[index] = Some(self.execute_one(request).await);
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(SyncError::Protocol("request was not executed".to_string()))))
            .collect()
    }
}

#[async_trait]
impl HistoryClient for GmailClient {
    async fn current_history_id(&self) -> SyncResult<String> {
        Ok(self.profile().await?.history_id)
    }

    async fn list_message_ids(&self, label: &str, page_token: Option<&str>) -> SyncResult<MessageIdPage> {
        let mut path = format!("/messages?maxResults={}", GMAIL_PAGE_SIZE);
        if label != ALL_MAIL_LABEL {
            path.push_str(&format!("&labelIds={}", label));
        }
        if matches!(label, "TRASH" | "SPAM") {
            path.push_str("&includeSpamTrash=true");
        }
        if let Some(token) = page_token {
            path.push_str(&format!("&pageToken={}", token));
        }
        let list: MessageList = self.transport.get_json(&path).await?;
        Ok(MessageIdPage {
            ids: list.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_messages(&self, ids: &[String]) -> Vec<(String, SyncResult<NewMailPackage>)> {
        stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let result = self.get_message(&id).await;
                (id, result)
            })
            .buffered(DOWNLOAD_CONCURRENCY)
            .collect()
            .await
    }

    async fn pull_history(&self, start_history_id: &str, page_token: Option<&str>) -> SyncResult<HistoryPage> {
        let mut path = format!(
            "/history?startHistoryId={}&maxResults={}",
            start_history_id, GMAIL_PAGE_SIZE
        );
        if let Some(token) = page_token {
            path.push_str(&format!("&pageToken={}", token));
        }

        let list: HistoryList = match self.transport.get_json(&path).await {
            Ok(list) => list,
            // History ids older than about a week are answered with 404
            Err(SyncError::Rejected { status: 404, .. }) => return Err(SyncError::CursorExpired),
            Err(e) => return Err(e),
        };

        let mut changes = Vec::new();
        for record in list.history {
            record.into_changes(&mut changes);
        }
        Ok(HistoryPage {
            changes,
            next_page_token: list.next_page_token,
            history_id: list.history_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderKind;
    use crate::provider::fake::StaticAuthenticator;
    use crate::requests::target;

    async fn setup() -> (GmailClient, crate::cache::Cache) {
        let account = Account::new("acc", "me@gmail.com", ProviderKind::Gmail);
        let cache = crate::cache::Cache::open_in_memory().await.unwrap();
        cache.ensure_account(&account).await.unwrap();
        cache
            .upsert_folders(
                "acc",
                &[
                    RemoteFolder::new("INBOX", "INBOX", SpecialFolder::Inbox),
                    RemoteFolder::new("TRASH", "TRASH", SpecialFolder::Trash),
                    RemoteFolder::new(ALL_MAIL_LABEL, "All Mail", SpecialFolder::Archive),
                ],
            )
            .await
            .unwrap();
        (GmailClient::new(account, Arc::new(StaticAuthenticator)).unwrap(), cache)
    }

    async fn folder_id(cache: &crate::cache::Cache, remote: &str) -> i64 {
        cache
            .get_folder_by_remote_id("acc", remote)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_archive_move_only_removes_inbox() {
        let (client, cache) = setup().await;
        let req = PendingRequest::new(
            "acc",
            RequestOperation::Move {
                target: target("m1", None),
                from: folder_id(&cache, "INBOX").await,
                to: folder_id(&cache, ALL_MAIL_LABEL).await,
            },
        );
        let native = client.prepare(&req, &cache).await.unwrap();
        assert_eq!(
            native,
            NativeRequest::ModifyLabels {
                ids: vec!["m1".to_string()],
                add: vec![],
                remove: vec!["INBOX".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_move_to_trash_uses_trash_endpoint() {
        let (client, cache) = setup().await;
        let req = PendingRequest::new(
            "acc",
            RequestOperation::Move {
                target: target("m1", None),
                from: folder_id(&cache, "INBOX").await,
                to: folder_id(&cache, "TRASH").await,
            },
        );
        match client.prepare(&req, &cache).await.unwrap() {
            NativeRequest::Http(http) => assert_eq!(http.path, "/messages/m1/trash"),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_carries_raw_message() {
        let (client, cache) = setup().await;
        let draft = Draft {
            local_id: "l1".to_string(),
            from_address: "me@gmail.com".to_string(),
            to: vec!["you@example.com".to_string()],
            subject: "Hi".to_string(),
            thread_id: Some("t1".to_string()),
            ..Default::default()
        };
        let req = PendingRequest::new("acc", RequestOperation::Send(draft));
        let NativeRequest::Http(http) = client.prepare(&req, &cache).await.unwrap() else {
            panic!("expected HTTP request");
        };
        let body = http.body.unwrap();
        assert_eq!(body["threadId"], "t1");
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(body["raw"].as_str().unwrap())
            .unwrap();
        assert!(String::from_utf8(raw).unwrap().contains("Subject: Hi"));
        assert!(http.created.is_some_and(|t| !t.is_draft));
    }

    #[test]
    fn test_identical_label_changes_are_grouped() {
        let requests = vec![
            modify(&target("a", None), &[], &[UNREAD_LABEL]),
            modify(&target("b", None), &[STARRED_LABEL], &[]),
            NativeRequest::Http(HttpRequest::new(Method::DELETE, "/messages/c")),
            modify(&target("d", None), &[], &[UNREAD_LABEL]),
        ];
        let groups = group_label_changes(&requests);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices, vec![0, 3]);
        assert_eq!(groups[0].ids, vec!["a".to_string(), "d".to_string()]);
        assert_eq!(groups[1].indices, vec![1]);
    }
}
