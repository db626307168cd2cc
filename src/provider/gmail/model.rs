//! Gmail REST resources and label semantics.

use serde::Deserialize;
use serde_json::Value;

use crate::constants::PREVIEW_LENGTH;
use crate::error::{SyncError, SyncResult};
use crate::model::{MailItem, NewMailPackage, SpecialFolder};
use crate::provider::HistoryChange;

/// Virtual folder holding every message outside Trash and Spam.
pub const ALL_MAIL_LABEL: &str = "ALL_MAIL";

pub const UNREAD_LABEL: &str = "UNREAD";
pub const STARRED_LABEL: &str = "STARRED";

/// Folder role of a label. `None` for labels that only carry state.
pub fn label_special(label_id: &str) -> Option<SpecialFolder> {
    match label_id {
        "INBOX" => Some(SpecialFolder::Inbox),
        "SENT" => Some(SpecialFolder::Sent),
        "DRAFT" => Some(SpecialFolder::Draft),
        "TRASH" => Some(SpecialFolder::Trash),
        "SPAM" => Some(SpecialFolder::Junk),
        ALL_MAIL_LABEL => Some(SpecialFolder::Archive),
        UNREAD_LABEL | STARRED_LABEL | "IMPORTANT" | "CHAT" => None,
        s if s.starts_with("CATEGORY_") => Some(SpecialFolder::Category),
        _ => Some(SpecialFolder::Other),
    }
}

fn is_outside_all_mail(label_id: &str) -> bool {
    matches!(label_id, "TRASH" | "SPAM")
}

/// Folder remote ids a message with these labels is assigned to.
pub fn folder_labels(labels: &[String]) -> Vec<String> {
    let mut folders: Vec<String> = labels
        .iter()
        .filter(|l| label_special(l).is_some())
        .cloned()
        .collect();
    if !labels.iter().any(|l| is_outside_all_mail(l)) {
        folders.push(ALL_MAIL_LABEL.to_string());
    }
    folders
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LabelList {
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    pub snippet: Option<String>,
    /// Milliseconds since the epoch, as a string
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Payload,
}

impl GmailMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn into_package(self) -> NewMailPackage {
        let (from_name, from_address) = self
            .header("From")
            .map(split_address)
            .unwrap_or_default();
        let has = |label: &str| self.label_ids.iter().any(|l| l == label);

        let item = MailItem {
            id: self.id.clone(),
            remote_id: self.id.clone(),
            uid: None,
            thread_id: self.thread_id.clone(),
            message_id: self.header("Message-ID").map(|s| s.to_string()),
            in_reply_to: self.header("In-Reply-To").map(|s| s.to_string()),
            references: self
                .header("References")
                .map(|r| r.split_whitespace().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
            subject: self.header("Subject").unwrap_or_default().to_string(),
            from_address,
            from_name,
            date: self
                .internal_date
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .map(|ms| ms / 1000)
                .unwrap_or_default(),
            preview: self
                .snippet
                .as_deref()
                .map(|s| s.chars().take(PREVIEW_LENGTH).collect()),
            is_read: !has(UNREAD_LABEL),
            is_flagged: has(STARRED_LABEL),
            is_draft: has("DRAFT"),
            mime_ref: Some(format!("/messages/{}?format=raw", self.id)),
        };
        NewMailPackage {
            folder_remote_ids: folder_labels(&self.label_ids),
            item,
        }
    }
}

/// Split `"Name <addr>"` into its parts.
fn split_address(value: &str) -> (Option<String>, String) {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            let name = value[..start].trim().trim_matches('"').trim();
            let address = value[start + 1..end].trim().to_string();
            ((!name.is_empty()).then(|| name.to_string()), address)
        }
        _ => (None, value.trim().to_string()),
    }
}

/// Package for a draft or sent message created from a local template.
/// `resource` is either a message or a draft wrapping one.
pub fn created_package(template: &MailItem, resource: &Value) -> SyncResult<NewMailPackage> {
    let message = resource.get("message").unwrap_or(resource);
    let id = message
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Protocol("created message has no id".to_string()))?;
    let labels: Vec<String> = message
        .get("labelIds")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let mut item = template.clone();
    item.id = id.to_string();
    item.remote_id = id.to_string();
    item.thread_id = message
        .get("threadId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| template.thread_id.clone());
    item.mime_ref = Some(format!("/messages/{}?format=raw", id));

    Ok(NewMailPackage {
        folder_remote_ids: folder_labels(&labels),
        item,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryList {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    pub history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
    pub message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelEnvelope {
    pub message: MessageRef,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(default)]
    pub messages_added: Vec<MessageEnvelope>,
    #[serde(default)]
    pub messages_deleted: Vec<MessageEnvelope>,
    #[serde(default)]
    pub labels_added: Vec<LabelEnvelope>,
    #[serde(default)]
    pub labels_removed: Vec<LabelEnvelope>,
}

impl HistoryRecord {
    /// Flatten into changes, translating state labels into state changes and
    /// keeping the virtual All Mail assignment consistent.
    pub fn into_changes(self, changes: &mut Vec<HistoryChange>) {
        for added in self.messages_added {
            changes.push(HistoryChange::MessageAdded {
                id: added.message.id,
            });
        }

        for change in self.labels_added {
            let id = change.message.id;
            let mut folders = Vec::new();
            for label in change.label_ids {
                if label == UNREAD_LABEL {
                    changes.push(HistoryChange::ReadChanged {
                        id: id.clone(),
                        is_read: false,
                    });
                } else if label == STARRED_LABEL {
                    changes.push(HistoryChange::FlagChanged {
                        id: id.clone(),
                        is_flagged: true,
                    });
                } else if label_special(&label).is_some() {
                    folders.push(label);
                }
            }
            let leaves_all_mail = folders.iter().any(|l| is_outside_all_mail(l));
            if !folders.is_empty() {
                changes.push(HistoryChange::LabelsAdded {
                    id: id.clone(),
                    labels: folders,
                });
            }
            if leaves_all_mail {
                changes.push(HistoryChange::LabelsRemoved {
                    id,
                    labels: vec![ALL_MAIL_LABEL.to_string()],
                });
            }
        }

        for change in self.labels_removed {
            let id = change.message.id;
            let mut folders = Vec::new();
            for label in change.label_ids {
                if label == UNREAD_LABEL {
                    changes.push(HistoryChange::ReadChanged {
                        id: id.clone(),
                        is_read: true,
                    });
                } else if label == STARRED_LABEL {
                    changes.push(HistoryChange::FlagChanged {
                        id: id.clone(),
                        is_flagged: false,
                    });
                } else if label_special(&label).is_some() {
                    folders.push(label);
                }
            }
            // Re-enter All Mail before the old assignment goes away
            if folders.iter().any(|l| is_outside_all_mail(l)) {
                changes.push(HistoryChange::LabelsAdded {
                    id: id.clone(),
                    labels: vec![ALL_MAIL_LABEL.to_string()],
                });
            }
            if !folders.is_empty() {
                changes.push(HistoryChange::LabelsRemoved { id, labels: folders });
            }
        }

        for deleted in self.messages_deleted {
            changes.push(HistoryChange::MessageDeleted {
                id: deleted.message.id,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_labels() {
        let labels = vec!["INBOX".to_string(), "UNREAD".to_string(), "CATEGORY_SOCIAL".to_string()];
        assert_eq!(folder_labels(&labels), vec!["INBOX", "CATEGORY_SOCIAL", ALL_MAIL_LABEL]);
        let trashed = vec!["TRASH".to_string()];
        assert_eq!(folder_labels(&trashed), vec!["TRASH"]);
    }

    #[test]
    fn test_message_into_package() {
        let json = r#"{
            "id": "18c1",
            "threadId": "18c0",
            "labelIds": ["INBOX", "UNREAD", "STARRED"],
            "snippet": "See you tomorrow",
            "internalDate": "1709285400000",
            "payload": {"headers": [
                {"name": "From", "value": "\"Alice Doe\" <alice@gmail.com>"},
                {"name": "Subject", "value": "Lunch"},
                {"name": "Message-ID", "value": "<m1@gmail.com>"},
                {"name": "References", "value": "<a@x> <b@x>"}
            ]}
        }"#;
        let message: GmailMessage = serde_json::from_str(json).unwrap();
        let package = message.into_package();
        assert_eq!(package.item.from_name.as_deref(), Some("Alice Doe"));
        assert_eq!(package.item.from_address, "alice@gmail.com");
        assert!(!package.item.is_read);
        assert!(package.item.is_flagged);
        assert_eq!(package.item.date, 1_709_285_400);
        assert_eq!(package.item.references.len(), 2);
        assert_eq!(package.folder_remote_ids, vec!["INBOX", ALL_MAIL_LABEL]);
    }

    #[test]
    fn test_created_package_from_draft_resource() {
        let template = MailItem {
            id: "local".to_string(),
            subject: "Draft".to_string(),
            is_draft: true,
            ..Default::default()
        };
        let resource = serde_json::json!({
            "id": "r-1",
            "message": {"id": "m-9", "threadId": "t-3", "labelIds": ["DRAFT"]}
        });
        let package = created_package(&template, &resource).unwrap();
        assert_eq!(package.item.id, "m-9");
        assert_eq!(package.item.thread_id.as_deref(), Some("t-3"));
        assert_eq!(package.item.subject, "Draft");
        assert_eq!(package.folder_remote_ids, vec!["DRAFT", ALL_MAIL_LABEL]);
    }

    #[test]
    fn test_history_translation() {
        let json = r#"{
            "labelsAdded": [{"message": {"id": "m1"}, "labelIds": ["TRASH", "UNREAD"]}],
            "labelsRemoved": [{"message": {"id": "m2"}, "labelIds": ["INBOX", "STARRED"]}],
            "messagesDeleted": [{"message": {"id": "m3"}}]
        }"#;
        let record: HistoryRecord = serde_json::from_str(json).unwrap();
        let mut changes = Vec::new();
        record.into_changes(&mut changes);

        assert_eq!(
            changes,
            vec![
                HistoryChange::ReadChanged { id: "m1".into(), is_read: false },
                HistoryChange::LabelsAdded { id: "m1".into(), labels: vec!["TRASH".into()] },
                HistoryChange::LabelsRemoved { id: "m1".into(), labels: vec![ALL_MAIL_LABEL.into()] },
                HistoryChange::FlagChanged { id: "m2".into(), is_flagged: false },
                HistoryChange::LabelsRemoved { id: "m2".into(), labels: vec!["INBOX".into()] },
                HistoryChange::MessageDeleted { id: "m3".into() },
            ]
        );
    }
}
