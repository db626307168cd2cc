//! Provider client adapters.
//!
//! One adapter per provider family. Adapters wrap the remote API, token
//! acquisition and transport retries. They hold no synchronization logic.

pub mod gmail;
pub mod graph;
pub mod http;
pub mod imap;
pub mod retry;
pub mod smtp;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;

use crate::cache::ChangeProcessor;
use crate::error::{SyncError, SyncResult};
use crate::model::{
    AccountProfile, Calendar, CalendarItem, Folder, FolderId, MailItem, MailState, NewMailPackage,
    RemoteCalendar, RemoteFolder,
};
use crate::requests::PendingRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum requests per batch call; `None` means requests run one by one.
    pub batch_size: Option<usize>,
}

/// A REST call in provider-relative form.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: reqwest::Method,
    /// Path relative to the provider base URL
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Locally composed item the response identifies (drafts, sent mail)
    pub created: Option<MailItem>,
    /// Local id superseded by the item in the response (server-side moves)
    pub replaces: Option<String>,
}

impl HttpRequest {
    pub fn new(method: reqwest::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            created: None,
            replaces: None,
        }
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn creating(mut self, item: MailItem) -> Self {
        self.created = Some(item);
        self
    }

    pub fn replacing(mut self, item: MailItem) -> Self {
        self.replaces = Some(item.id.clone());
        self.created = Some(item);
        self
    }
}

/// Provider-native form of a pending request, produced by [`RemoteClient::prepare`].
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRequest {
    Http(HttpRequest),
    /// Label change; identical changes are merged into one `batchModify` call.
    ModifyLabels {
        ids: Vec<String>,
        add: Vec<String>,
        remove: Vec<String>,
    },
    StoreFlags {
        mailbox: String,
        uid: u32,
        flag: &'static str,
        add: bool,
    },
    MoveMessage { mailbox: String, uid: u32, target: String },
    Expunge { mailbox: String, uid: u32 },
    Append {
        mailbox: String,
        flags: &'static str,
        message: Vec<u8>,
    },
    RenameMailbox { from: String, to: String },
    /// SMTP submission plus a copy appended to the sent mailbox
    Submit {
        from: String,
        recipients: Vec<String>,
        message: Vec<u8>,
        sent_mailbox: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeResponse {
    /// Entity the server created (draft or sent message) to store directly.
    pub created: Option<NewMailPackage>,
    /// Local id the created entity supersedes
    pub replaces: Option<String>,
}

/// One page of a delta query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePage<T> {
    pub items: Vec<T>,
    /// Remote ids removed since the cursor
    pub deletions: Vec<String>,
    /// Next link while `has_more`, otherwise the final delta link
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdPage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryChange {
    MessageAdded { id: String },
    MessageDeleted { id: String },
    /// Folder labels, as folder remote ids
    LabelsAdded { id: String, labels: Vec<String> },
    LabelsRemoved { id: String, labels: Vec<String> },
    ReadChanged { id: String, is_read: bool },
    FlagChanged { id: String, is_flagged: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub changes: Vec<HistoryChange>,
    pub next_page_token: Option<String>,
    /// Latest history id reported by the server
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub uid_validity: u32,
    pub uid_next: Option<u32>,
    /// Absent when the server lacks CONDSTORE
    pub highest_mod_seq: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagUpdate {
    pub uid: u32,
    pub state: MailState,
}

/// Operations every provider family supports.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn fetch_profile(&self) -> SyncResult<AccountProfile>;

    async fn list_folders(&self) -> SyncResult<Vec<RemoteFolder>>;

    /// Force a token refresh, surfacing `AuthenticationRequired` if it fails.
    async fn refresh_token(&self) -> SyncResult<()>;

    /// Translate a pending request into its native form. May look up
    /// folder remote ids through `lookup`.
    async fn prepare(&self, request: &PendingRequest, lookup: &dyn ChangeProcessor) -> SyncResult<NativeRequest>;

    /// Execute requests, at most `capabilities().batch_size` at a time.
    /// Returns one result per request, in order.
    async fn execute_batch(&self, requests: Vec<NativeRequest>) -> Vec<SyncResult<NativeResponse>>;
}

#[async_trait]
pub trait DeltaClient: RemoteClient {
    async fn pull_folder_changes(
        &self,
        folder: &Folder,
        cursor: Option<&str>,
    ) -> SyncResult<ChangePage<NewMailPackage>>;

    async fn list_calendars(&self) -> SyncResult<Vec<RemoteCalendar>>;

    async fn pull_calendar_changes(
        &self,
        calendar: &Calendar,
        cursor: Option<&str>,
    ) -> SyncResult<ChangePage<CalendarItem>>;
}

#[async_trait]
pub trait HistoryClient: RemoteClient {
    async fn current_history_id(&self) -> SyncResult<String>;

    async fn list_message_ids(&self, label: &str, page_token: Option<&str>) -> SyncResult<MessageIdPage>;

    /// Per-id results so single failures can be queued for retry.
    async fn get_messages(&self, ids: &[String]) -> Vec<(String, SyncResult<NewMailPackage>)>;

    async fn pull_history(&self, start_history_id: &str, page_token: Option<&str>) -> SyncResult<HistoryPage>;
}

#[async_trait]
pub trait ProtocolClient: RemoteClient {
    async fn examine(&self, folder: &Folder) -> SyncResult<MailboxStatus>;

    async fn fetch_uids(&self, folder: &Folder) -> SyncResult<Vec<u32>>;

    async fn fetch_changed_since(&self, folder: &Folder, mod_seq: u64) -> SyncResult<Vec<FlagUpdate>>;

    /// Items come back with `id`, `uid` and flags set; thread ids are left empty.
    async fn fetch_headers(&self, folder: &Folder, uids: &[u32]) -> SyncResult<Vec<MailItem>>;
}

/// Remote id of a folder, as stored locally.
pub(crate) async fn folder_remote_id(lookup: &dyn ChangeProcessor, folder_id: FolderId) -> SyncResult<String> {
    lookup
        .get_folder(folder_id)
        .await?
        .map(|f| f.remote_id)
        .ok_or_else(|| SyncError::rejected(404, format!("folder {} no longer exists", folder_id)))
}

/// Run `requests` through `execute_one` in order.
pub(crate) async fn execute_sequentially<F, Fut>(requests: Vec<NativeRequest>, mut execute_one: F) -> Vec<SyncResult<NativeResponse>>
where
    F: FnMut(NativeRequest) -> Fut,
    Fut: std::future::Future<Output = SyncResult<NativeResponse>>,
{
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        results.push(execute_one(request).await);
    }
    results
}

pub(crate) fn unsupported(provider: &str, request: &PendingRequest) -> SyncError {
    SyncError::rejected(
        400,
        format!("{} is not supported by {}", request.name(), provider),
    )
}
