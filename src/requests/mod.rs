//! User mutations: intent -> pending request -> optimistic apply -> remote execution.

pub mod engine;
pub mod local;
pub mod processor;
pub mod queue;

use std::time::Duration;

use crate::constants::{RESYNC_DELAY_MOVE, RESYNC_DELAY_SEND, RESYNC_DELAY_STATE};
use crate::model::{AccountId, Draft, FolderId, MailId, ResponseStatus};

/// Answer to a meeting invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsvpResponse {
    Accept,
    Tentative,
    Decline,
}

impl RsvpResponse {
    pub fn status(self) -> ResponseStatus {
        match self {
            RsvpResponse::Accept => ResponseStatus::Accepted,
            RsvpResponse::Tentative => ResponseStatus::Tentative,
            RsvpResponse::Decline => ResponseStatus::Declined,
        }
    }
}

/// What the user asked for, before toggle rules are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailAction {
    MarkRead,
    MarkUnread,
    Flag,
    Unflag,
    Move { target: FolderId },
    Delete,
    Archive,
    Unarchive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    Mail { action: MailAction, mail_ids: Vec<MailId> },
    MarkFolderRead { folder_id: FolderId },
    RenameFolder { folder_id: FolderId, name: String },
    CreateDraft(Draft),
    Send(Draft),
    Rsvp {
        item_id: String,
        response: RsvpResponse,
        comment: Option<String>,
    },
}

/// Remote coordinates of a mail item, captured when the request is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailTarget {
    pub mail_id: MailId,
    pub remote_id: String,
    pub uid: Option<u32>,
    /// Current folder (per-folder providers)
    pub folder_id: Option<FolderId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOperation {
    MarkRead(MailTarget),
    MarkUnread(MailTarget),
    Flag(MailTarget),
    Unflag(MailTarget),
    Move {
        target: MailTarget,
        from: FolderId,
        to: FolderId,
    },
    /// Label providers only
    AddLabel { target: MailTarget, folder: FolderId },
    RemoveLabel { target: MailTarget, folder: FolderId },
    /// Permanent deletion
    Delete(MailTarget),
    CreateDraft(Draft),
    Send(Draft),
    RenameFolder { folder_id: FolderId, name: String },
    Rsvp {
        item_id: String,
        response: RsvpResponse,
        comment: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub account_id: AccountId,
    pub operation: RequestOperation,
}

impl PendingRequest {
    pub fn new(account_id: impl Into<AccountId>, operation: RequestOperation) -> Self {
        Self {
            account_id: account_id.into(),
            operation,
        }
    }

    /// Requests with equal keys supersede each other in the queue.
    pub fn grouping_key(&self) -> String {
        use RequestOperation::*;
        match &self.operation {
            MarkRead(t) | MarkUnread(t) => format!("read:{}", t.mail_id),
            Flag(t) | Unflag(t) => format!("flag:{}", t.mail_id),
            Move { target, .. } | Delete(target) => format!("location:{}", target.mail_id),
            AddLabel { target, folder } | RemoveLabel { target, folder } => {
                format!("label:{}:{}", target.mail_id, folder)
            }
            CreateDraft(draft) | Send(draft) => format!("compose:{}", draft.local_id),
            RenameFolder { folder_id, .. } => format!("rename:{}", folder_id),
            Rsvp { item_id, .. } => format!("rsvp:{}", item_id),
        }
    }

    /// How long the server needs before a pull reflects this change.
    pub fn resynchronization_delay(&self) -> Duration {
        use RequestOperation::*;
        match &self.operation {
            MarkRead(_) | MarkUnread(_) | Flag(_) | Unflag(_) => RESYNC_DELAY_STATE,
            Move { .. } | AddLabel { .. } | RemoveLabel { .. } | Delete(_) | RenameFolder { .. } | Rsvp { .. } => {
                RESYNC_DELAY_MOVE
            }
            CreateDraft(_) | Send(_) => RESYNC_DELAY_SEND,
        }
    }

    pub fn mail_target(&self) -> Option<&MailTarget> {
        use RequestOperation::*;
        match &self.operation {
            MarkRead(t) | MarkUnread(t) | Flag(t) | Unflag(t) | Delete(t) => Some(t),
            Move { target, .. } | AddLabel { target, .. } | RemoveLabel { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Folders whose contents change once this request lands.
    pub fn affected_folders(&self) -> Vec<FolderId> {
        use RequestOperation::*;
        match &self.operation {
            Move { from, to, .. } => vec![*from, *to],
            AddLabel { folder, .. } | RemoveLabel { folder, .. } => vec![*folder],
            RenameFolder { folder_id, .. } => vec![*folder_id],
            _ => self
                .mail_target()
                .and_then(|t| t.folder_id)
                .into_iter()
                .collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        use RequestOperation::*;
        match &self.operation {
            MarkRead(_) => "MarkRead",
            MarkUnread(_) => "MarkUnread",
            Flag(_) => "Flag",
            Unflag(_) => "Unflag",
            Move { .. } => "Move",
            AddLabel { .. } => "AddLabel",
            RemoveLabel { .. } => "RemoveLabel",
            Delete(_) => "Delete",
            CreateDraft(_) => "CreateDraft",
            Send(_) => "Send",
            RenameFolder { .. } => "RenameFolder",
            Rsvp { .. } => "Rsvp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    pub request: PendingRequest,
    pub error: String,
}

/// Outcome of draining the request queue once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestExecutionResult {
    pub succeeded: usize,
    pub failed: Vec<RequestFailure>,
    /// Maximum resynchronization delay of the executed batch
    pub resync_delay: Duration,
    pub affected_folders: Vec<FolderId>,
    /// A request failed because the account must sign in again
    pub auth_required: bool,
}

impl RequestExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.succeeded == 0 && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: RequestExecutionResult) {
        self.succeeded += other.succeeded;
        self.failed.extend(other.failed);
        self.resync_delay = self.resync_delay.max(other.resync_delay);
        self.auth_required |= other.auth_required;
        for folder in other.affected_folders {
            if !self.affected_folders.contains(&folder) {
                self.affected_folders.push(folder);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn target(mail_id: &str, folder_id: Option<FolderId>) -> MailTarget {
    MailTarget {
        mail_id: mail_id.to_string(),
        remote_id: mail_id.to_string(),
        uid: None,
        folder_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_toggles_share_grouping_key() {
        let read = PendingRequest::new("acc", RequestOperation::MarkRead(target("m1", None)));
        let unread = PendingRequest::new("acc", RequestOperation::MarkUnread(target("m1", None)));
        let flag = PendingRequest::new("acc", RequestOperation::Flag(target("m1", None)));
        assert_eq!(read.grouping_key(), unread.grouping_key());
        assert_ne!(read.grouping_key(), flag.grouping_key());
    }

    #[test]
    fn test_resync_delays() {
        let read = PendingRequest::new("acc", RequestOperation::MarkRead(target("m1", None)));
        let send = PendingRequest::new("acc", RequestOperation::Send(Draft::default()));
        assert!(read.resynchronization_delay() < send.resynchronization_delay());
    }

    #[test]
    fn test_affected_folders_for_move() {
        let req = PendingRequest::new(
            "acc",
            RequestOperation::Move {
                target: target("m1", Some(1)),
                from: 1,
                to: 2,
            },
        );
        assert_eq!(req.affected_folders(), vec![1, 2]);
    }
}
