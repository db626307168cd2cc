//! Optimistic local mutations and their undo tokens.
//!
//! Every request maps to a [`LocalMutation`] that is written through the
//! change processor before the request reaches the server. Applying returns an
//! [`UndoToken`] holding exactly the state the mutation overwrote.

use anyhow::Result;

use super::{PendingRequest, RequestOperation};
use crate::cache::ChangeProcessor;
use crate::model::{Draft, FolderId, MailId, MailSnapshot, NewMailPackage, ResponseStatus, SpecialFolder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalMutation {
    SetRead { mail_id: MailId, is_read: bool },
    SetFlagged { mail_id: MailId, is_flagged: bool },
    /// Protocol mail changes identity when moved, so it's dropped until the
    /// target folder is pulled again.
    MoveMail { mail_id: MailId, from: FolderId, to: FolderId },
    AddToFolder { mail_id: MailId, folder: FolderId },
    RemoveFromFolder { mail_id: MailId, folder: FolderId },
    DeleteMail { mail_id: MailId },
    InsertDraft(Draft),
    RemoveDraft { local_id: String },
    RenameFolder { folder_id: FolderId, name: String },
    SetResponse { item_id: String, response: ResponseStatus },
}

impl LocalMutation {
    pub fn for_request(request: &PendingRequest) -> Self {
        use RequestOperation::*;
        match &request.operation {
            MarkRead(t) => LocalMutation::SetRead {
                mail_id: t.mail_id.clone(),
                is_read: true,
            },
            MarkUnread(t) => LocalMutation::SetRead {
                mail_id: t.mail_id.clone(),
                is_read: false,
            },
            Flag(t) => LocalMutation::SetFlagged {
                mail_id: t.mail_id.clone(),
                is_flagged: true,
            },
            Unflag(t) => LocalMutation::SetFlagged {
                mail_id: t.mail_id.clone(),
                is_flagged: false,
            },
            Move { target, from, to } => LocalMutation::MoveMail {
                mail_id: target.mail_id.clone(),
                from: *from,
                to: *to,
            },
            AddLabel { target, folder } => LocalMutation::AddToFolder {
                mail_id: target.mail_id.clone(),
                folder: *folder,
            },
            RemoveLabel { target, folder } => LocalMutation::RemoveFromFolder {
                mail_id: target.mail_id.clone(),
                folder: *folder,
            },
            Delete(t) => LocalMutation::DeleteMail {
                mail_id: t.mail_id.clone(),
            },
            CreateDraft(draft) => LocalMutation::InsertDraft(draft.clone()),
            Send(draft) => LocalMutation::RemoveDraft {
                local_id: draft.local_id.clone(),
            },
            RenameFolder { folder_id, name } => LocalMutation::RenameFolder {
                folder_id: *folder_id,
                name: name.clone(),
            },
            Rsvp { item_id, response, .. } => LocalMutation::SetResponse {
                item_id: item_id.clone(),
                response: response.status(),
            },
        }
    }
}

/// What a revert has to put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoToken {
    /// The mutation had nothing to change locally
    Nothing,
    Read { mail_id: MailId, was_read: bool },
    Flagged { mail_id: MailId, was_flagged: bool },
    Restore(MailSnapshot),
    RemoveInserted { mail_id: MailId },
    FolderName { folder_id: FolderId, name: String },
    Response { item_id: String, response: ResponseStatus },
}

pub async fn apply(cache: &dyn ChangeProcessor, account_id: &str, mutation: &LocalMutation) -> Result<UndoToken> {
    match mutation {
        LocalMutation::SetRead { mail_id, is_read } => {
            let Some(item) = cache.get_mail(account_id, mail_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            cache.set_read_status(account_id, mail_id, *is_read).await?;
            Ok(UndoToken::Read {
                mail_id: mail_id.clone(),
                was_read: item.is_read,
            })
        }
        LocalMutation::SetFlagged { mail_id, is_flagged } => {
            let Some(item) = cache.get_mail(account_id, mail_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            cache.set_flag_status(account_id, mail_id, *is_flagged).await?;
            Ok(UndoToken::Flagged {
                mail_id: mail_id.clone(),
                was_flagged: item.is_flagged,
            })
        }
        LocalMutation::MoveMail { mail_id, from, to } => {
            let Some(snapshot) = cache.snapshot_mail(account_id, mail_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            if snapshot.item.uid.is_some() {
                cache.delete_mail(account_id, mail_id).await?;
            } else {
                let mut folders: Vec<FolderId> =
                    snapshot.folder_ids.iter().copied().filter(|f| f != from).collect();
                if !folders.contains(to) {
                    folders.push(*to);
                }
                cache.set_mail_folders(account_id, mail_id, &folders).await?;
            }
            Ok(UndoToken::Restore(snapshot))
        }
        LocalMutation::AddToFolder { mail_id, folder } => {
            let Some(snapshot) = cache.snapshot_mail(account_id, mail_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            let mut folders = snapshot.folder_ids.clone();
            if !folders.contains(folder) {
                folders.push(*folder);
            }
            cache.set_mail_folders(account_id, mail_id, &folders).await?;
            Ok(UndoToken::Restore(snapshot))
        }
        LocalMutation::RemoveFromFolder { mail_id, folder } => {
            let Some(snapshot) = cache.snapshot_mail(account_id, mail_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            let folders: Vec<FolderId> = snapshot.folder_ids.iter().copied().filter(|f| f != folder).collect();
            cache.set_mail_folders(account_id, mail_id, &folders).await?;
            Ok(UndoToken::Restore(snapshot))
        }
        LocalMutation::DeleteMail { mail_id } => {
            let Some(snapshot) = cache.snapshot_mail(account_id, mail_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            cache.delete_mail(account_id, mail_id).await?;
            Ok(UndoToken::Restore(snapshot))
        }
        LocalMutation::InsertDraft(draft) => {
            let Some(drafts) = cache.get_special_folder(account_id, SpecialFolder::Draft).await? else {
                return Ok(UndoToken::Nothing);
            };
            let package = NewMailPackage::new(draft.to_mail_item(true), drafts.remote_id);
            if cache.upsert_mail(account_id, &package).await? {
                Ok(UndoToken::RemoveInserted {
                    mail_id: draft.local_id.clone(),
                })
            } else {
                Ok(UndoToken::Nothing)
            }
        }
        LocalMutation::RemoveDraft { local_id } => {
            let Some(snapshot) = cache.snapshot_mail(account_id, local_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            cache.delete_mail(account_id, local_id).await?;
            Ok(UndoToken::Restore(snapshot))
        }
        LocalMutation::RenameFolder { folder_id, name } => {
            let Some(folder) = cache.get_folder(*folder_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            cache.rename_folder(*folder_id, name).await?;
            Ok(UndoToken::FolderName {
                folder_id: *folder_id,
                name: folder.name,
            })
        }
        LocalMutation::SetResponse { item_id, response } => {
            let Some(item) = cache.get_calendar_item(account_id, item_id).await? else {
                return Ok(UndoToken::Nothing);
            };
            cache.set_calendar_response(account_id, item_id, *response).await?;
            Ok(UndoToken::Response {
                item_id: item_id.clone(),
                response: item.response,
            })
        }
    }
}

pub async fn revert(cache: &dyn ChangeProcessor, account_id: &str, token: UndoToken) -> Result<()> {
    match token {
        UndoToken::Nothing => {}
        UndoToken::Read { mail_id, was_read } => cache.set_read_status(account_id, &mail_id, was_read).await?,
        UndoToken::Flagged { mail_id, was_flagged } => {
            cache.set_flag_status(account_id, &mail_id, was_flagged).await?
        }
        UndoToken::Restore(snapshot) => cache.restore_mail(account_id, &snapshot).await?,
        UndoToken::RemoveInserted { mail_id } => cache.delete_mail(account_id, &mail_id).await?,
        UndoToken::FolderName { folder_id, name } => cache.rename_folder(folder_id, &name).await?,
        UndoToken::Response { item_id, response } => {
            cache.set_calendar_response(account_id, &item_id, response).await?
        }
    }
    Ok(())
}
