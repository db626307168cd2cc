use std::collections::HashMap;

use super::account::AccountId;

pub type FolderId = i64;

/// Role of a folder, independent of its provider-specific name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialFolder {
    Inbox,
    Sent,
    Draft,
    Trash,
    Junk,
    Archive,
    /// Gmail system categories (CATEGORY_*) and similar non-folder labels
    Category,
    Other,
}

impl SpecialFolder {
    pub fn as_str(self) -> &'static str {
        match self {
            SpecialFolder::Inbox => "inbox",
            SpecialFolder::Sent => "sent",
            SpecialFolder::Draft => "draft",
            SpecialFolder::Trash => "trash",
            SpecialFolder::Junk => "junk",
            SpecialFolder::Archive => "archive",
            SpecialFolder::Category => "category",
            SpecialFolder::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => SpecialFolder::Inbox,
            "sent" => SpecialFolder::Sent,
            "draft" => SpecialFolder::Draft,
            "trash" => SpecialFolder::Trash,
            "junk" => SpecialFolder::Junk,
            "archive" => SpecialFolder::Archive,
            "category" => SpecialFolder::Category,
            _ => SpecialFolder::Other,
        }
    }

    /// Best-effort role detection from a display name, for servers that
    /// don't advertise SPECIAL-USE attributes.
    pub fn guess_from_name(name: &str) -> Self {
        let upper = name.to_uppercase();
        let leaf = upper.rsplit(['/', '.']).next().unwrap_or(&upper);
        match leaf {
            "INBOX" => SpecialFolder::Inbox,
            s if s.contains("SENT") => SpecialFolder::Sent,
            s if s.contains("DRAFT") => SpecialFolder::Draft,
            s if s.contains("TRASH") || s.contains("DELETED") => SpecialFolder::Trash,
            s if s.contains("SPAM") || s.contains("JUNK") => SpecialFolder::Junk,
            s if s.contains("ARCHIVE") => SpecialFolder::Archive,
            _ => SpecialFolder::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: FolderId,
    pub account_id: AccountId,
    pub remote_id: String,
    pub parent_remote_id: Option<String>,
    pub name: String,
    pub special: SpecialFolder,
    /// Opaque per-folder delta cursor (delta providers)
    pub cursor: Option<String>,
    pub uid_validity: Option<u32>,
    pub highest_mod_seq: Option<u64>,
    pub sync_enabled: bool,
    pub initial_sync_completed: bool,
}

/// A folder as reported by a provider's folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub remote_id: String,
    pub parent_remote_id: Option<String>,
    pub name: String,
    pub special: SpecialFolder,
    /// Default synchronization flag for newly discovered folders
    pub sync_enabled: bool,
}

impl RemoteFolder {
    pub fn new(remote_id: impl Into<String>, name: impl Into<String>, special: SpecialFolder) -> Self {
        Self {
            remote_id: remote_id.into(),
            parent_remote_id: None,
            name: name.into(),
            special,
            sync_enabled: !matches!(special, SpecialFolder::Category),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_remote_id = Some(parent.into());
        self
    }
}

/// Result of comparing local folder rows with a remote listing by remote id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderDiff {
    pub inserted: Vec<RemoteFolder>,
    pub updated: Vec<(FolderId, RemoteFolder)>,
    pub deleted: Vec<Folder>,
}

impl FolderDiff {
    pub fn compute(local: &[Folder], remote: &[RemoteFolder]) -> Self {
        let local_by_remote: HashMap<&str, &Folder> =
            local.iter().map(|f| (f.remote_id.as_str(), f)).collect();
        let remote_ids: HashMap<&str, &RemoteFolder> =
            remote.iter().map(|f| (f.remote_id.as_str(), f)).collect();

        let mut diff = FolderDiff::default();

        for folder in remote {
            match local_by_remote.get(folder.remote_id.as_str()) {
                None => diff.inserted.push(folder.clone()),
                Some(existing) => {
                    if existing.name != folder.name
                        || existing.parent_remote_id != folder.parent_remote_id
                        || existing.special != folder.special
                    {
                        diff.updated.push((existing.id, folder.clone()));
                    }
                }
            }
        }

        diff.deleted = local
            .iter()
            .filter(|f| !remote_ids.contains_key(f.remote_id.as_str()))
            .cloned()
            .collect();

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}
