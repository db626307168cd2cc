//! Scripted in-memory provider used by unit tests.
//!
//! One [`FakeProvider`] implements every client family. Tests queue pages and
//! results up front, then inspect what the synchronizer or engine asked for.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    Capabilities, ChangePage, DeltaClient, FlagUpdate, HistoryClient, HistoryPage, HttpRequest,
    MailboxStatus, MessageIdPage, NativeRequest, NativeResponse, ProtocolClient, RemoteClient,
};
use crate::auth::{AccessToken, Authenticator};
use crate::cache::ChangeProcessor;
use crate::error::{AuthError, SyncError, SyncResult};
use crate::model::{
    Account, AccountProfile, Calendar, CalendarItem, Folder, MailItem, NewMailPackage,
    RemoteCalendar, RemoteFolder, protocol_mail_id,
};
use crate::requests::{PendingRequest, RequestOperation};

/// Hands out a fixed bearer token.
pub struct StaticAuthenticator;

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn get_token(&self, _account: &Account) -> Result<AccessToken, AuthError> {
        Ok(AccessToken::bearer("test-token", i64::MAX))
    }

    async fn invalidate(&self, _account: &Account) {}
}

/// One mailbox of the protocol fake.
#[derive(Debug, Clone)]
pub struct FakeMailbox {
    pub uid_validity: u32,
    pub highest_mod_seq: Option<u64>,
    /// Messages by UID; `id` and `uid` are filled in when fetched
    pub messages: HashMap<u32, MailItem>,
    pub changed: Vec<FlagUpdate>,
}

impl FakeMailbox {
    pub fn new(uid_validity: u32, highest_mod_seq: Option<u64>) -> Self {
        Self {
            uid_validity,
            highest_mod_seq,
            messages: HashMap::new(),
            changed: Vec::new(),
        }
    }

    pub fn with_message(mut self, uid: u32, subject: &str) -> Self {
        self.messages.insert(
            uid,
            MailItem {
                subject: subject.to_string(),
                message_id: Some(format!("<{}@fake>", uid)),
                ..Default::default()
            },
        );
        self
    }
}

#[derive(Default)]
struct FakeState {
    batch_size: Option<usize>,
    profile: Option<AccountProfile>,
    folders: Vec<RemoteFolder>,
    calendars: Vec<RemoteCalendar>,
    refresh_error: Option<SyncError>,

    // request execution
    executed: Vec<NativeRequest>,
    execute_script: VecDeque<SyncResult<NativeResponse>>,
    execute_calls: usize,

    // delta family
    folder_pages: HashMap<String, VecDeque<SyncResult<ChangePage<NewMailPackage>>>>,
    calendar_pages: HashMap<String, VecDeque<SyncResult<ChangePage<CalendarItem>>>>,
    cursors_seen: Vec<(String, Option<String>)>,

    // history family
    history_id: String,
    label_ids: HashMap<String, Vec<String>>,
    messages: HashMap<String, NewMailPackage>,
    failing_ids: HashSet<String>,
    history_pages: VecDeque<SyncResult<HistoryPage>>,
    history_starts: Vec<String>,

    // protocol family
    mailboxes: HashMap<String, FakeMailbox>,
    examine_errors: VecDeque<SyncError>,
}

pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                history_id: "1".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn with_batch_size(self, size: usize) -> Self {
        self.state.lock().unwrap().batch_size = Some(size);
        self
    }

    pub fn with_folders(self, folders: Vec<RemoteFolder>) -> Self {
        self.state.lock().unwrap().folders = folders;
        self
    }

    pub fn set_folders(&self, folders: Vec<RemoteFolder>) {
        self.state.lock().unwrap().folders = folders;
    }

    pub fn set_profile(&self, profile: AccountProfile) {
        self.state.lock().unwrap().profile = Some(profile);
    }

    pub fn set_calendars(&self, calendars: Vec<RemoteCalendar>) {
        self.state.lock().unwrap().calendars = calendars;
    }

    pub fn fail_refresh(&self, error: SyncError) {
        self.state.lock().unwrap().refresh_error = Some(error);
    }

    /// Next execution results, one per request; unscripted requests succeed.
    pub fn script_execution(&self, result: SyncResult<NativeResponse>) {
        self.state.lock().unwrap().execute_script.push_back(result);
    }

    pub fn executed(&self) -> Vec<NativeRequest> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Number of `execute_batch` calls.
    pub fn execute_calls(&self) -> usize {
        self.state.lock().unwrap().execute_calls
    }

    pub fn push_folder_page(&self, folder_remote_id: &str, page: SyncResult<ChangePage<NewMailPackage>>) {
        self.state
            .lock()
            .unwrap()
            .folder_pages
            .entry(folder_remote_id.to_string())
            .or_default()
            .push_back(page);
    }

    pub fn push_calendar_page(&self, calendar_remote_id: &str, page: SyncResult<ChangePage<CalendarItem>>) {
        self.state
            .lock()
            .unwrap()
            .calendar_pages
            .entry(calendar_remote_id.to_string())
            .or_default()
            .push_back(page);
    }

    /// `(folder remote id, cursor)` for every delta pull, in order.
    pub fn cursors_seen(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().cursors_seen.clone()
    }

    pub fn set_history_id(&self, id: &str) {
        self.state.lock().unwrap().history_id = id.to_string();
    }

    /// Register a downloadable message, listed under each of its labels.
    pub fn add_message(&self, package: NewMailPackage) {
        let mut state = self.state.lock().unwrap();
        for label in &package.folder_remote_ids {
            state
                .label_ids
                .entry(label.clone())
                .or_default()
                .push(package.item.id.clone());
        }
        state.messages.insert(package.item.id.clone(), package);
    }

    pub fn fail_download(&self, id: &str) {
        self.state.lock().unwrap().failing_ids.insert(id.to_string());
    }

    pub fn heal_download(&self, id: &str) {
        self.state.lock().unwrap().failing_ids.remove(id);
    }

    pub fn push_history_page(&self, page: SyncResult<HistoryPage>) {
        self.state.lock().unwrap().history_pages.push_back(page);
    }

    pub fn history_starts(&self) -> Vec<String> {
        self.state.lock().unwrap().history_starts.clone()
    }

    pub fn set_mailbox(&self, remote_id: &str, mailbox: FakeMailbox) {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .insert(remote_id.to_string(), mailbox);
    }

    pub fn fail_next_examine(&self, error: SyncError) {
        self.state.lock().unwrap().examine_errors.push_back(error);
    }
}

#[async_trait]
impl RemoteClient for FakeProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            batch_size: self.state.lock().unwrap().batch_size,
        }
    }

    async fn fetch_profile(&self) -> SyncResult<AccountProfile> {
        self.state
            .lock()
            .unwrap()
            .profile
            .clone()
            .ok_or_else(|| SyncError::rejected(404, "no profile"))
    }

    async fn list_folders(&self) -> SyncResult<Vec<RemoteFolder>> {
        Ok(self.state.lock().unwrap().folders.clone())
    }

    async fn refresh_token(&self) -> SyncResult<()> {
        match self.state.lock().unwrap().refresh_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn prepare(&self, request: &PendingRequest, _lookup: &dyn ChangeProcessor) -> SyncResult<NativeRequest> {
        let http = HttpRequest::new(reqwest::Method::POST, format!("/{}", request.grouping_key()));
        Ok(NativeRequest::Http(match &request.operation {
            RequestOperation::CreateDraft(draft) => http.creating(draft.to_mail_item(true)),
            RequestOperation::Rsvp { response, .. } if *response == crate::requests::RsvpResponse::Decline => {
                return Err(SyncError::rejected(400, "declines are not supported"));
            }
            _ => http,
        }))
    }

    async fn execute_batch(&self, requests: Vec<NativeRequest>) -> Vec<SyncResult<NativeResponse>> {
        let mut state = self.state.lock().unwrap();
        state.execute_calls += 1;
        requests
            .into_iter()
            .map(|request| {
                state.executed.push(request);
                state
                    .execute_script
                    .pop_front()
                    .unwrap_or_else(|| Ok(NativeResponse::default()))
            })
            .collect()
    }
}

#[async_trait]
impl DeltaClient for FakeProvider {
    async fn pull_folder_changes(
        &self,
        folder: &Folder,
        cursor: Option<&str>,
    ) -> SyncResult<ChangePage<NewMailPackage>> {
        let mut state = self.state.lock().unwrap();
        state
            .cursors_seen
            .push((folder.remote_id.clone(), cursor.map(|c| c.to_string())));
        state
            .folder_pages
            .get_mut(&folder.remote_id)
            .and_then(|pages| pages.pop_front())
            .unwrap_or_else(|| {
                Ok(ChangePage {
                    items: Vec::new(),
                    deletions: Vec::new(),
                    next_cursor: cursor.map(|c| c.to_string()),
                    has_more: false,
                })
            })
    }

    async fn list_calendars(&self) -> SyncResult<Vec<RemoteCalendar>> {
        Ok(self.state.lock().unwrap().calendars.clone())
    }

    async fn pull_calendar_changes(
        &self,
        calendar: &Calendar,
        cursor: Option<&str>,
    ) -> SyncResult<ChangePage<CalendarItem>> {
        self.state
            .lock()
            .unwrap()
            .calendar_pages
            .get_mut(&calendar.remote_id)
            .and_then(|pages| pages.pop_front())
            .unwrap_or_else(|| {
                Ok(ChangePage {
                    items: Vec::new(),
                    deletions: Vec::new(),
                    next_cursor: cursor.map(|c| c.to_string()),
                    has_more: false,
                })
            })
    }
}

#[async_trait]
impl HistoryClient for FakeProvider {
    async fn current_history_id(&self) -> SyncResult<String> {
        Ok(self.state.lock().unwrap().history_id.clone())
    }

    async fn list_message_ids(&self, label: &str, _page_token: Option<&str>) -> SyncResult<MessageIdPage> {
        Ok(MessageIdPage {
            ids: self
                .state
                .lock()
                .unwrap()
                .label_ids
                .get(label)
                .cloned()
                .unwrap_or_default(),
            next_page_token: None,
        })
    }

    async fn get_messages(&self, ids: &[String]) -> Vec<(String, SyncResult<NewMailPackage>)> {
        let state = self.state.lock().unwrap();
        ids.iter()
            .map(|id| {
                let result = if state.failing_ids.contains(id) {
                    Err(SyncError::Transport("download failed".to_string()))
                } else {
                    state
                        .messages
                        .get(id)
                        .cloned()
                        .ok_or_else(|| SyncError::rejected(404, format!("no message {}", id)))
                };
                (id.clone(), result)
            })
            .collect()
    }

    async fn pull_history(&self, start_history_id: &str, _page_token: Option<&str>) -> SyncResult<HistoryPage> {
        let mut state = self.state.lock().unwrap();
        state.history_starts.push(start_history_id.to_string());
        let current = state.history_id.clone();
        state.history_pages.pop_front().unwrap_or_else(|| {
            Ok(HistoryPage {
                changes: Vec::new(),
                next_page_token: None,
                history_id: Some(current),
            })
        })
    }
}

impl FakeProvider {
    fn mailbox(&self, folder: &Folder) -> SyncResult<FakeMailbox> {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(&folder.remote_id)
            .cloned()
            .ok_or_else(|| SyncError::rejected(0, format!("NO mailbox {}", folder.remote_id)))
    }
}

#[async_trait]
impl ProtocolClient for FakeProvider {
    async fn examine(&self, folder: &Folder) -> SyncResult<MailboxStatus> {
        if let Some(e) = self.state.lock().unwrap().examine_errors.pop_front() {
            return Err(e);
        }
        let mailbox = self.mailbox(folder)?;
        Ok(MailboxStatus {
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.messages.keys().max().map(|m| m + 1),
            highest_mod_seq: mailbox.highest_mod_seq,
        })
    }

    async fn fetch_uids(&self, folder: &Folder) -> SyncResult<Vec<u32>> {
        let mut uids: Vec<u32> = self.mailbox(folder)?.messages.keys().copied().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_changed_since(&self, folder: &Folder, _mod_seq: u64) -> SyncResult<Vec<FlagUpdate>> {
        Ok(self.mailbox(folder)?.changed)
    }

    async fn fetch_headers(&self, folder: &Folder, uids: &[u32]) -> SyncResult<Vec<MailItem>> {
        let mailbox = self.mailbox(folder)?;
        Ok(uids
            .iter()
            .filter_map(|uid| {
                mailbox.messages.get(uid).map(|template| MailItem {
                    id: protocol_mail_id(folder.id, *uid),
                    remote_id: uid.to_string(),
                    uid: Some(*uid),
                    ..template.clone()
                })
            })
            .collect())
    }
}
