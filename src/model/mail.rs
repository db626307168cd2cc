use super::folder::{FolderId, SpecialFolder};

/// Local identity of a mail item.
///
/// REST providers use the server-assigned message id. The protocol provider has no
/// server-wide id, so it uses `"{folder_id}:{uid}"`, see [`protocol_mail_id`].
pub type MailId = String;

pub fn protocol_mail_id(folder_id: FolderId, uid: u32) -> MailId {
    format!("{}:{}", folder_id, uid)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailItem {
    pub id: MailId,
    pub remote_id: String,
    /// Protocol UID (protocol provider only)
    pub uid: Option<u32>,
    pub thread_id: Option<String>,
    // Threading headers
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    /// Creation date as a unix timestamp
    pub date: i64,
    pub preview: Option<String>,
    pub is_read: bool,
    pub is_flagged: bool,
    pub is_draft: bool,
    /// Provider reference used to download the MIME content later
    pub mime_ref: Option<String>,
}

impl MailItem {
    pub fn display_from(&self) -> &str {
        self.from_name.as_deref().unwrap_or(&self.from_address)
    }
}

/// A mail item as seen through one of its folder assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailCopy {
    pub item: MailItem,
    pub folder_id: FolderId,
    pub folder_special: SpecialFolder,
}

/// Downloaded message plus the folders (by remote id) it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMailPackage {
    pub item: MailItem,
    pub folder_remote_ids: Vec<String>,
}

impl NewMailPackage {
    pub fn new(item: MailItem, folder_remote_id: impl Into<String>) -> Self {
        Self {
            item,
            folder_remote_ids: vec![folder_remote_id.into()],
        }
    }
}

/// Full local state of a mail item, captured before a destructive change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSnapshot {
    pub item: MailItem,
    pub folder_ids: Vec<FolderId>,
}

/// Local read/flag state refreshed from a provider without re-downloading the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailState {
    pub is_read: bool,
    pub is_flagged: bool,
}
