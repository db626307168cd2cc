//! Microsoft Graph adapter (Outlook / Office 365).
//!
//! Mail is pulled per folder through `messages/delta`, events per calendar
//! through `calendarView/delta`. Mutations are sent through JSON batching.

mod batch;
mod model;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use self::batch::{BatchResponse, batch_body, created_response, not_graph_request, split_batch_response};
use self::model::{Collection, GraphCalendar, GraphEvent, GraphFolder, GraphMessage, GraphUser, message_resource};
use super::http::{RestTransport, decode_json};
use super::{
    Capabilities, ChangePage, DeltaClient, HttpRequest, NativeRequest, NativeResponse, RemoteClient,
    folder_remote_id, unsupported,
};
use crate::auth::Authenticator;
use crate::cache::ChangeProcessor;
use crate::constants::{GRAPH_BATCH_SIZE, GRAPH_PAGE_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    Account, AccountProfile, Calendar, CalendarItem, Folder, NewMailPackage, RemoteCalendar,
    RemoteFolder, SpecialFolder,
};
use crate::requests::{MailTarget, PendingRequest, RequestOperation, RsvpResponse};

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

const MESSAGE_SELECT: &str = "subject,from,receivedDateTime,isRead,isDraft,flag,bodyPreview,conversationId,internetMessageId,parentFolderId";

/// Calendar window synchronized through calendarView delta.
const CALENDAR_PAST_DAYS: i64 = 30;
const CALENDAR_FUTURE_DAYS: i64 = 365;

/// Well-known folder aliases resolved to ids while listing folders.
const WELL_KNOWN_FOLDERS: [(&str, SpecialFolder); 6] = [
    ("inbox", SpecialFolder::Inbox),
    ("sentitems", SpecialFolder::Sent),
    ("drafts", SpecialFolder::Draft),
    ("deleteditems", SpecialFolder::Trash),
    ("junkemail", SpecialFolder::Junk),
    ("archive", SpecialFolder::Archive),
];

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

pub struct GraphClient {
    transport: RestTransport,
}

impl GraphClient {
    pub fn new(account: Account, authenticator: Arc<dyn Authenticator>) -> SyncResult<Self> {
        Ok(Self {
            transport: RestTransport::new(GRAPH_BASE_URL, account, authenticator)?,
        })
    }

    /// Follow `@odata.nextLink` until the collection is exhausted.
    async fn get_all<T: DeserializeOwned>(&self, path: String) -> SyncResult<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(path);
        while let Some(path) = next {
            let page: Collection<T> = self.transport.get_json(&path).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    async fn well_known_folder_ids(&self) -> SyncResult<HashMap<String, SpecialFolder>> {
        let mut ids = HashMap::new();
        for (alias, special) in WELL_KNOWN_FOLDERS {
            let path = format!("/me/mailFolders/{}?$select=id", alias);
            match self.transport.get_json::<IdOnly>(&path).await {
                Ok(folder) => {
                    ids.insert(folder.id, special);
                }
                // Not every mailbox has an archive folder
                Err(SyncError::Rejected { status: 404, .. }) => {
                    tracing::debug!("Well-known folder {} not present", alias);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }

    async fn execute_one(&self, request: &NativeRequest) -> SyncResult<NativeResponse> {
        let NativeRequest::Http(http) = request else {
            return Err(not_graph_request());
        };
        let response = self
            .transport
            .send(http.method.clone(), &http.path, http.body.as_ref())
            .await?;
        if http.created.is_none() {
            return Ok(NativeResponse::default());
        }
        let message: GraphMessage = decode_json(response).await?;
        Ok(created_response(http, message))
    }

    async fn execute_json_batch(&self, chunk: &[NativeRequest]) -> Vec<SyncResult<NativeResponse>> {
        let body = batch_body(chunk);
        tracing::debug!("Sending Graph batch of {} requests", chunk.len());
        match self
            .transport
            .send_json::<BatchResponse>(Method::POST, "/$batch", Some(&body))
            .await
        {
            Ok(response) => split_batch_response(chunk, response),
            Err(e) => {
                tracing::warn!("Graph batch call failed: {}", e);
                chunk.iter().map(|_| Err(e.duplicate())).collect()
            }
        }
    }
}

fn message_patch(target: &MailTarget, body: serde_json::Value) -> HttpRequest {
    HttpRequest::new(Method::PATCH, format!("/me/messages/{}", target.remote_id)).json(body)
}

fn rsvp_action(response: RsvpResponse) -> &'static str {
    match response {
        RsvpResponse::Accept => "accept",
        RsvpResponse::Tentative => "tentativelyAccept",
        RsvpResponse::Decline => "decline",
    }
}

#[async_trait]
impl RemoteClient for GraphClient {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            batch_size: Some(GRAPH_BATCH_SIZE),
        }
    }

    async fn fetch_profile(&self) -> SyncResult<AccountProfile> {
        let user: GraphUser = self
            .transport
            .get_json("/me?$select=mail,userPrincipalName,displayName")
            .await?;
        Ok(AccountProfile {
            address: user
                .mail
                .or(user.user_principal_name)
                .unwrap_or_else(|| self.transport.account().address.clone()),
            display_name: user.display_name,
        })
    }

    async fn list_folders(&self) -> SyncResult<Vec<RemoteFolder>> {
        let specials = self.well_known_folder_ids().await?;
        let mut folders = Vec::new();
        let mut pending: Vec<(String, Option<String>)> =
            vec![(format!("/me/mailFolders?$top={}", GRAPH_PAGE_SIZE), None)];

        while let Some((path, parent)) = pending.pop() {
            let page: Vec<GraphFolder> = self.get_all(path).await?;
            for folder in page {
                if folder.child_folder_count > 0 {
                    pending.push((
                        format!("/me/mailFolders/{}/childFolders?$top={}", folder.id, GRAPH_PAGE_SIZE),
                        Some(folder.id.clone()),
                    ));
                }
                let special = specials
                    .get(&folder.id)
                    .copied()
                    .unwrap_or(SpecialFolder::Other);
                let mut remote = RemoteFolder::new(folder.id, folder.display_name, special);
                if let Some(parent) = &parent {
                    remote = remote.with_parent(parent.clone());
                }
                folders.push(remote);
            }
        }

        tracing::debug!("Listed {} Graph folders", folders.len());
        Ok(folders)
    }

    async fn refresh_token(&self) -> SyncResult<()> {
        self.transport.refresh_token().await
    }

    async fn prepare(&self, request: &PendingRequest, lookup: &dyn ChangeProcessor) -> SyncResult<NativeRequest> {
        use RequestOperation::*;
        let http = match &request.operation {
            MarkRead(t) => message_patch(t, json!({ "isRead": true })),
            MarkUnread(t) => message_patch(t, json!({ "isRead": false })),
            Flag(t) => message_patch(t, json!({ "flag": { "flagStatus": "flagged" } })),
            Unflag(t) => message_patch(t, json!({ "flag": { "flagStatus": "notFlagged" } })),
            Move { target, to, .. } => {
                let destination = folder_remote_id(lookup, *to).await?;
                let http = HttpRequest::new(Method::POST, format!("/me/messages/{}/move", target.remote_id))
                    .json(json!({ "destinationId": destination }));
                // The moved message may come back under a new id
                match lookup.get_mail(&request.account_id, &target.mail_id).await? {
                    Some(item) => http.replacing(item),
                    None => http,
                }
            }
            Delete(t) => HttpRequest::new(Method::POST, format!("/me/messages/{}/permanentDelete", t.remote_id)),
            CreateDraft(draft) => HttpRequest::new(Method::POST, "/me/messages")
                .json(message_resource(draft))
                .creating(draft.to_mail_item(true)),
            Send(draft) => HttpRequest::new(Method::POST, "/me/sendMail").json(json!({
                "message": message_resource(draft),
                "saveToSentItems": true,
            })),
            RenameFolder { folder_id, name } => {
                let remote = folder_remote_id(lookup, *folder_id).await?;
                HttpRequest::new(Method::PATCH, format!("/me/mailFolders/{}", remote))
                    .json(json!({ "displayName": name }))
            }
            Rsvp {
                item_id,
                response,
                comment,
            } => HttpRequest::new(Method::POST, format!("/me/events/{}/{}", item_id, rsvp_action(*response)))
                .json(json!({
                    "comment": comment.clone().unwrap_or_default(),
                    "sendResponse": true,
                })),
            AddLabel { .. } | RemoveLabel { .. } => return Err(unsupported("Outlook", request)),
        };
        Ok(NativeRequest::Http(http))
    }

    async fn execute_batch(&self, requests: Vec<NativeRequest>) -> Vec<SyncResult<NativeResponse>> {
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(GRAPH_BATCH_SIZE) {
            if let [single] = chunk {
                results.push(self.execute_one(single).await);
            } else {
                results.extend(self.execute_json_batch(chunk).await);
            }
        }
        results
    }
}

#[async_trait]
impl DeltaClient for GraphClient {
    async fn pull_folder_changes(
        &self,
        folder: &Folder,
        cursor: Option<&str>,
    ) -> SyncResult<ChangePage<NewMailPackage>> {
        let path = match cursor {
            Some(link) => link.to_string(),
            None => format!(
                "/me/mailFolders/{}/messages/delta?$select={}&$top={}",
                folder.remote_id, MESSAGE_SELECT, GRAPH_PAGE_SIZE
            ),
        };
        let page: Collection<GraphMessage> = self.transport.get_json(&path).await?;

        let mut items = Vec::new();
        let mut deletions = Vec::new();
        for message in page.value {
            if message.is_removed() {
                deletions.push(message.id);
            } else {
                items.push(message.into_package(&folder.remote_id));
            }
        }

        Ok(ChangePage {
            items,
            deletions,
            has_more: page.next_link.is_some(),
            next_cursor: page.next_link.or(page.delta_link),
        })
    }

    async fn list_calendars(&self) -> SyncResult<Vec<RemoteCalendar>> {
        let calendars: Vec<GraphCalendar> = self
            .get_all(format!("/me/calendars?$select=id,name,isDefaultCalendar&$top={}", GRAPH_PAGE_SIZE))
            .await?;
        Ok(calendars.into_iter().map(RemoteCalendar::from).collect())
    }

    async fn pull_calendar_changes(
        &self,
        calendar: &Calendar,
        cursor: Option<&str>,
    ) -> SyncResult<ChangePage<CalendarItem>> {
        let path = match cursor {
            Some(link) => link.to_string(),
            None => {
                let now = Utc::now();
                let start = (now - ChronoDuration::days(CALENDAR_PAST_DAYS)).to_rfc3339_opts(SecondsFormat::Secs, true);
                let end = (now + ChronoDuration::days(CALENDAR_FUTURE_DAYS)).to_rfc3339_opts(SecondsFormat::Secs, true);
                format!(
                    "/me/calendars/{}/calendarView/delta?startDateTime={}&endDateTime={}",
                    calendar.remote_id, start, end
                )
            }
        };
        let page: Collection<GraphEvent> = self.transport.get_json(&path).await?;

        let mut items = Vec::new();
        let mut deletions = Vec::new();
        for event in page.value {
            if event.is_removed() {
                deletions.push(event.id);
            } else {
                items.push(event.into_item(&calendar.remote_id));
            }
        }

        Ok(ChangePage {
            items,
            deletions,
            has_more: page.next_link.is_some(),
            next_cursor: page.next_link.or(page.delta_link),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Draft, ProviderKind};
    use crate::provider::fake::StaticAuthenticator;
    use crate::requests::target;

    async fn setup() -> (GraphClient, crate::cache::Cache) {
        let account = Account::new("acc", "me@contoso.com", ProviderKind::Outlook);
        let cache = crate::cache::Cache::open_in_memory().await.unwrap();
        cache.ensure_account(&account).await.unwrap();
        cache
            .upsert_folders(
                "acc",
                &[
                    RemoteFolder::new("inbox-id", "Inbox", SpecialFolder::Inbox),
                    RemoteFolder::new("archive-id", "Archive", SpecialFolder::Archive),
                ],
            )
            .await
            .unwrap();
        (GraphClient::new(account, Arc::new(StaticAuthenticator)).unwrap(), cache)
    }

    fn http(request: NativeRequest) -> HttpRequest {
        match request {
            NativeRequest::Http(h) => h,
            other => panic!("expected HTTP request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prepare_state_changes() {
        let (client, cache) = setup().await;
        let req = PendingRequest::new("acc", RequestOperation::Flag(target("m1", None)));
        let prepared = http(client.prepare(&req, &cache).await.unwrap());
        assert_eq!(prepared.method, Method::PATCH);
        assert_eq!(prepared.path, "/me/messages/m1");
        assert_eq!(prepared.body.unwrap()["flag"]["flagStatus"], "flagged");
    }

    #[tokio::test]
    async fn test_prepare_move_resolves_destination() {
        let (client, cache) = setup().await;
        let archive = cache
            .get_folder_by_remote_id("acc", "archive-id")
            .await
            .unwrap()
            .unwrap();
        let req = PendingRequest::new(
            "acc",
            RequestOperation::Move {
                target: target("m1", None),
                from: archive.id - 1,
                to: archive.id,
            },
        );
        let prepared = http(client.prepare(&req, &cache).await.unwrap());
        assert_eq!(prepared.path, "/me/messages/m1/move");
        assert_eq!(prepared.body.unwrap()["destinationId"], "archive-id");
    }

    #[tokio::test]
    async fn test_prepare_draft_and_rsvp() {
        let (client, cache) = setup().await;
        let draft = Draft {
            local_id: "local-1".to_string(),
            from_address: "me@contoso.com".to_string(),
            to: vec!["you@contoso.com".to_string()],
            subject: "Hi".to_string(),
            ..Default::default()
        };
        let req = PendingRequest::new("acc", RequestOperation::CreateDraft(draft));
        let prepared = http(client.prepare(&req, &cache).await.unwrap());
        assert_eq!(prepared.path, "/me/messages");
        assert!(prepared.created.is_some());

        let req = PendingRequest::new(
            "acc",
            RequestOperation::Rsvp {
                item_id: "ev1".to_string(),
                response: RsvpResponse::Tentative,
                comment: None,
            },
        );
        let prepared = http(client.prepare(&req, &cache).await.unwrap());
        assert_eq!(prepared.path, "/me/events/ev1/tentativelyAccept");
    }

    #[tokio::test]
    async fn test_labels_unsupported() {
        let (client, cache) = setup().await;
        let req = PendingRequest::new(
            "acc",
            RequestOperation::AddLabel {
                target: target("m1", None),
                folder: 1,
            },
        );
        assert!(matches!(
            client.prepare(&req, &cache).await,
            Err(SyncError::Rejected { status: 400, .. })
        ));
    }
}
