//! Turns user intents into pending requests.
//!
//! Toggle rules are evaluated against each item's cached state, so "mark read"
//! on a read message becomes "mark unread" and "archive" on archived mail
//! becomes "unarchive".

use tokio::sync::Mutex;

use super::queue::RequestQueue;
use super::{MailAction, MailTarget, PendingRequest, RequestOperation, UserIntent};
use crate::cache::ChangeProcessor;
use crate::error::{SyncError, SyncResult};
use crate::model::{Account, Folder, FolderId, MailItem, SpecialFolder};

/// Cached state of one mail item at the moment an intent is processed.
#[derive(Debug)]
pub struct MailContext {
    pub item: MailItem,
    pub folders: Vec<Folder>,
}

impl MailContext {
    fn is_in(&self, special: SpecialFolder) -> bool {
        self.folders.iter().any(|f| f.special == special)
    }

    fn contains(&self, folder_id: FolderId) -> bool {
        self.folders.iter().any(|f| f.id == folder_id)
    }

    fn is_archived(&self) -> bool {
        self.is_in(SpecialFolder::Archive) && !self.is_in(SpecialFolder::Inbox)
    }

    /// The folder the user sees the message in. Label providers keep every
    /// message under All Mail, which never counts.
    fn primary_folder(&self) -> Option<&Folder> {
        self.folders
            .iter()
            .find(|f| !matches!(f.special, SpecialFolder::Archive | SpecialFolder::Category))
            .or_else(|| self.folders.first())
    }

    fn folder(&self, special: SpecialFolder) -> Option<&Folder> {
        self.folders.iter().find(|f| f.special == special)
    }

    fn target(&self, folder: Option<&Folder>) -> MailTarget {
        MailTarget {
            mail_id: self.item.id.clone(),
            remote_id: self.item.remote_id.clone(),
            uid: self.item.uid,
            folder_id: folder.map(|f| f.id),
        }
    }
}

pub struct ToggleRule {
    pub source: MailAction,
    pub target: MailAction,
    pub predicate: fn(&MailContext) -> bool,
}

pub const TOGGLE_RULES: &[ToggleRule] = &[
    ToggleRule {
        source: MailAction::MarkRead,
        target: MailAction::MarkUnread,
        predicate: |ctx| ctx.item.is_read,
    },
    ToggleRule {
        source: MailAction::MarkUnread,
        target: MailAction::MarkRead,
        predicate: |ctx| !ctx.item.is_read,
    },
    ToggleRule {
        source: MailAction::Flag,
        target: MailAction::Unflag,
        predicate: |ctx| ctx.item.is_flagged,
    },
    ToggleRule {
        source: MailAction::Unflag,
        target: MailAction::Flag,
        predicate: |ctx| !ctx.item.is_flagged,
    },
    ToggleRule {
        source: MailAction::Archive,
        target: MailAction::Unarchive,
        predicate: MailContext::is_archived,
    },
    ToggleRule {
        source: MailAction::Unarchive,
        target: MailAction::Archive,
        predicate: |ctx| !ctx.is_archived(),
    },
];

/// First matching rule wins; no match keeps the action.
pub fn resolve_action(action: MailAction, ctx: &MailContext) -> MailAction {
    TOGGLE_RULES
        .iter()
        .find(|rule| rule.source == action && (rule.predicate)(ctx))
        .map(|rule| rule.target)
        .unwrap_or(action)
}

/// Special folders an intent may need, looked up once per intent.
#[derive(Debug, Default)]
struct SpecialFolders {
    inbox: Option<Folder>,
    archive: Option<Folder>,
    trash: Option<Folder>,
}

pub struct RequestProcessor<'a> {
    cache: &'a dyn ChangeProcessor,
    account: &'a Account,
}

impl<'a> RequestProcessor<'a> {
    pub fn new(cache: &'a dyn ChangeProcessor, account: &'a Account) -> Self {
        Self { cache, account }
    }

    pub async fn process(&self, intent: UserIntent) -> SyncResult<Vec<PendingRequest>> {
        let account_id = &self.account.id;
        let operations = match intent {
            UserIntent::Mail { action, mail_ids } => self.process_mail(action, &mail_ids).await?,
            UserIntent::MarkFolderRead { folder_id } => self.process_folder_read(folder_id).await?,
            UserIntent::RenameFolder { folder_id, name } => {
                if self.cache.get_folder(folder_id).await?.is_none() {
                    return Err(SyncError::rejected(404, format!("folder {} does not exist", folder_id)));
                }
                vec![RequestOperation::RenameFolder { folder_id, name }]
            }
            UserIntent::CreateDraft(draft) => vec![RequestOperation::CreateDraft(draft)],
            UserIntent::Send(draft) => {
                if draft.to.is_empty() && draft.cc.is_empty() {
                    return Err(SyncError::rejected(400, "message has no recipients"));
                }
                vec![RequestOperation::Send(draft)]
            }
            UserIntent::Rsvp {
                item_id,
                response,
                comment,
            } => vec![RequestOperation::Rsvp {
                item_id,
                response,
                comment,
            }],
        };

        Ok(operations
            .into_iter()
            .map(|op| PendingRequest::new(account_id.clone(), op))
            .collect())
    }

    /// Process `intent` and queue the result. Returns how many requests were queued.
    pub async fn enqueue(&self, intent: UserIntent, queue: &Mutex<RequestQueue>) -> SyncResult<usize> {
        let requests = self.process(intent).await?;
        let count = requests.len();
        let mut queue = queue.lock().await;
        for request in requests {
            queue.push(request);
        }
        Ok(count)
    }

    async fn process_mail(&self, action: MailAction, mail_ids: &[String]) -> SyncResult<Vec<RequestOperation>> {
        let specials = self.special_folders().await?;
        let mut operations = Vec::with_capacity(mail_ids.len());

        for mail_id in mail_ids {
            let Some(ctx) = self.context(mail_id).await? else {
                tracing::debug!("Skipping {} for unknown mail {}", action_name(action), mail_id);
                continue;
            };
            let resolved = resolve_action(action, &ctx);
            match self.operation_for(resolved, &ctx, &specials)? {
                Some(op) => operations.push(op),
                None => tracing::debug!("{} on {} is a no-op", action_name(resolved), mail_id),
            }
        }
        Ok(operations)
    }

    async fn process_folder_read(&self, folder_id: FolderId) -> SyncResult<Vec<RequestOperation>> {
        let account_id = &self.account.id;
        let Some(folder) = self.cache.get_folder(folder_id).await? else {
            return Err(SyncError::rejected(404, format!("folder {} does not exist", folder_id)));
        };

        let mut operations = Vec::new();
        for mail_id in self.cache.get_unread_in_folder(account_id, folder_id).await? {
            if let Some(item) = self.cache.get_mail(account_id, &mail_id).await? {
                let ctx = MailContext {
                    item,
                    folders: Vec::new(),
                };
                operations.push(RequestOperation::MarkRead(ctx.target(Some(&folder))));
            }
        }
        tracing::debug!("Marking {} messages read in {}", operations.len(), folder.name);
        Ok(operations)
    }

    async fn context(&self, mail_id: &str) -> SyncResult<Option<MailContext>> {
        let account_id = &self.account.id;
        let Some(item) = self.cache.get_mail(account_id, mail_id).await? else {
            return Ok(None);
        };
        let folders = self.cache.get_assignments(account_id, mail_id).await?;
        Ok(Some(MailContext { item, folders }))
    }

    async fn special_folders(&self) -> SyncResult<SpecialFolders> {
        let account_id = &self.account.id;
        Ok(SpecialFolders {
            inbox: self.cache.get_special_folder(account_id, SpecialFolder::Inbox).await?,
            archive: self.cache.get_special_folder(account_id, SpecialFolder::Archive).await?,
            trash: self.cache.get_special_folder(account_id, SpecialFolder::Trash).await?,
        })
    }

    fn operation_for(
        &self,
        action: MailAction,
        ctx: &MailContext,
        specials: &SpecialFolders,
    ) -> SyncResult<Option<RequestOperation>> {
        let primary = ctx.primary_folder();
        let target = ctx.target(primary);

        let op = match action {
            MailAction::MarkRead => RequestOperation::MarkRead(target),
            MailAction::MarkUnread => RequestOperation::MarkUnread(target),
            MailAction::Flag => RequestOperation::Flag(target),
            MailAction::Unflag => RequestOperation::Unflag(target),
            MailAction::Move { target: to } => {
                if ctx.contains(to) {
                    return Ok(None);
                }
                return Ok(self.move_to(ctx, primary, to));
            }
            MailAction::Delete => {
                let in_trash = ctx.is_in(SpecialFolder::Trash);
                match &specials.trash {
                    Some(trash) if !in_trash => return Ok(self.move_to(ctx, primary, trash.id)),
                    _ => RequestOperation::Delete(target),
                }
            }
            MailAction::Archive => {
                let archive = specials
                    .archive
                    .as_ref()
                    .ok_or_else(|| SyncError::rejected(400, "account has no archive folder"))?;
                if self.account.provider.uses_labels() {
                    // Archiving a label message only drops the Inbox label
                    let Some(inbox) = ctx.folder(SpecialFolder::Inbox) else {
                        return Ok(None);
                    };
                    RequestOperation::RemoveLabel {
                        target: ctx.target(Some(inbox)),
                        folder: inbox.id,
                    }
                } else {
                    let from = ctx.folder(SpecialFolder::Inbox).or(primary);
                    return Ok(self.move_to(ctx, from, archive.id));
                }
            }
            MailAction::Unarchive => {
                let inbox = specials
                    .inbox
                    .as_ref()
                    .ok_or_else(|| SyncError::rejected(400, "account has no inbox"))?;
                if ctx.contains(inbox.id) {
                    return Ok(None);
                }
                if self.account.provider.uses_labels() {
                    RequestOperation::AddLabel {
                        target: ctx.target(Some(inbox)),
                        folder: inbox.id,
                    }
                } else {
                    let from = ctx.folder(SpecialFolder::Archive).or(primary);
                    return Ok(self.move_to(ctx, from, inbox.id));
                }
            }
        };
        Ok(Some(op))
    }

    fn move_to(&self, ctx: &MailContext, from: Option<&Folder>, to: FolderId) -> Option<RequestOperation> {
        let Some(from) = from else {
            tracing::warn!("{} has no folder assignment, cannot move it", ctx.item.id);
            return None;
        };
        Some(RequestOperation::Move {
            target: ctx.target(Some(from)),
            from: from.id,
            to,
        })
    }
}

fn action_name(action: MailAction) -> &'static str {
    match action {
        MailAction::MarkRead => "MarkRead",
        MailAction::MarkUnread => "MarkUnread",
        MailAction::Flag => "Flag",
        MailAction::Unflag => "Unflag",
        MailAction::Move { .. } => "Move",
        MailAction::Delete => "Delete",
        MailAction::Archive => "Archive",
        MailAction::Unarchive => "Unarchive",
    }
}
