//! Microsoft Graph JSON resources and their conversion into cache types.

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;

use crate::constants::PREVIEW_LENGTH;
use crate::model::{
    Attendee, CalendarItem, CalendarItemKind, Draft, MailItem, NewMailPackage, RemoteCalendar,
    ResponseStatus,
};

#[derive(Debug, Deserialize)]
pub struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFolder {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub child_folder_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphUser {
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailAddress {
    pub address: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: EmailAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowupFlag {
    pub flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMessage {
    pub id: String,
    pub subject: Option<String>,
    pub from: Option<Recipient>,
    pub received_date_time: Option<String>,
    pub is_read: Option<bool>,
    pub is_draft: Option<bool>,
    pub flag: Option<FollowupFlag>,
    pub body_preview: Option<String>,
    pub conversation_id: Option<String>,
    pub internet_message_id: Option<String>,
    pub parent_folder_id: Option<String>,
    #[serde(rename = "@removed")]
    pub removed: Option<Value>,
}

impl GraphMessage {
    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    /// `fallback_folder` is used when the resource omits `parentFolderId`.
    pub fn into_package(self, fallback_folder: &str) -> NewMailPackage {
        let (from_address, from_name) = self
            .from
            .map(|r| (r.email_address.address.unwrap_or_default(), r.email_address.name))
            .unwrap_or_default();
        let folder = self
            .parent_folder_id
            .unwrap_or_else(|| fallback_folder.to_string());
        let item = MailItem {
            id: self.id.clone(),
            remote_id: self.id.clone(),
            uid: None,
            thread_id: self.conversation_id,
            message_id: self.internet_message_id,
            in_reply_to: None,
            references: Vec::new(),
            subject: self.subject.unwrap_or_default(),
            from_address,
            from_name,
            date: self
                .received_date_time
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.timestamp())
                .unwrap_or_default(),
            preview: self
                .body_preview
                .map(|p| p.chars().take(PREVIEW_LENGTH).collect()),
            is_read: self.is_read.unwrap_or(false),
            is_flagged: self
                .flag
                .and_then(|f| f.flag_status)
                .is_some_and(|s| s == "flagged"),
            is_draft: self.is_draft.unwrap_or(false),
            mime_ref: Some(format!("/me/messages/{}/$value", self.id)),
        };
        NewMailPackage::new(item, folder)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCalendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_default_calendar: bool,
}

impl From<GraphCalendar> for RemoteCalendar {
    fn from(c: GraphCalendar) -> Self {
        RemoteCalendar {
            remote_id: c.id,
            name: c.name,
            is_primary: c.is_default_calendar,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeTimeZone {
    pub date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseStatusResource {
    pub response: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphAttendee {
    pub email_address: EmailAddress,
    pub status: Option<ResponseStatusResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEvent {
    pub id: String,
    pub subject: Option<String>,
    pub start: Option<DateTimeTimeZone>,
    pub end: Option<DateTimeTimeZone>,
    #[serde(default)]
    pub is_all_day: bool,
    pub location: Option<Location>,
    pub recurrence: Option<Value>,
    pub organizer: Option<Recipient>,
    pub series_master_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub response_status: Option<ResponseStatusResource>,
    #[serde(default)]
    pub attendees: Vec<GraphAttendee>,
    #[serde(rename = "@removed")]
    pub removed: Option<Value>,
}

/// Graph returns UTC date-times without an offset, with up to 7 fractional digits.
fn parse_graph_datetime(value: &DateTimeTimeZone) -> i64 {
    NaiveDateTime::parse_from_str(&value.date_time, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

impl GraphEvent {
    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    pub fn into_item(self, calendar_remote_id: &str) -> CalendarItem {
        let kind = match self.event_type.as_deref() {
            Some("seriesMaster") => CalendarItemKind::Master,
            Some("occurrence") => CalendarItemKind::Occurrence,
            Some("exception") => CalendarItemKind::Exception,
            _ => CalendarItemKind::Single,
        };
        CalendarItem {
            id: self.id,
            calendar_remote_id: calendar_remote_id.to_string(),
            title: self.subject.unwrap_or_default(),
            start: self.start.as_ref().map(parse_graph_datetime).unwrap_or_default(),
            end: self.end.as_ref().map(parse_graph_datetime).unwrap_or_default(),
            all_day: self.is_all_day,
            location: self
                .location
                .and_then(|l| l.display_name)
                .filter(|s| !s.is_empty()),
            recurrence_rule: self.recurrence.filter(|r| !r.is_null()).map(|r| r.to_string()),
            organizer: self.organizer.and_then(|o| o.email_address.address),
            recurring_parent_id: self.series_master_id,
            kind,
            response: self
                .response_status
                .and_then(|s| s.response)
                .map(|s| ResponseStatus::parse(&s))
                .unwrap_or_default(),
            attendees: self
                .attendees
                .into_iter()
                .filter_map(|a| {
                    Some(Attendee {
                        address: a.email_address.address?,
                        name: a.email_address.name,
                        response: a
                            .status
                            .and_then(|s| s.response)
                            .map(|s| ResponseStatus::parse(&s))
                            .unwrap_or_default(),
                    })
                })
                .collect(),
        }
    }
}

fn recipients(addresses: &[String]) -> Vec<Value> {
    addresses
        .iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| serde_json::json!({ "emailAddress": { "address": a.trim() } }))
        .collect()
}

/// Message resource body for draft creation and sendMail.
pub fn message_resource(draft: &Draft) -> Value {
    serde_json::json!({
        "subject": draft.subject,
        "body": { "contentType": "Text", "content": draft.body },
        "toRecipients": recipients(&draft.to),
        "ccRecipients": recipients(&draft.cc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_into_package() {
        let json = r#"{
            "id": "AAMk1",
            "subject": "Quarterly report",
            "from": {"emailAddress": {"address": "boss@contoso.com", "name": "Boss"}},
            "receivedDateTime": "2024-03-01T09:30:00Z",
            "isRead": false,
            "isDraft": false,
            "flag": {"flagStatus": "flagged"},
            "bodyPreview": "Please review",
            "conversationId": "conv-1",
            "internetMessageId": "<r1@contoso.com>",
            "parentFolderId": "inbox-id"
        }"#;
        let message: GraphMessage = serde_json::from_str(json).unwrap();
        assert!(!message.is_removed());
        let package = message.into_package("fallback");
        assert_eq!(package.folder_remote_ids, vec!["inbox-id".to_string()]);
        assert_eq!(package.item.thread_id.as_deref(), Some("conv-1"));
        assert!(package.item.is_flagged);
        assert_eq!(package.item.date, 1_709_285_400);
        assert_eq!(package.item.display_from(), "Boss");
    }

    #[test]
    fn test_removed_message() {
        let json = r#"{"id": "gone", "@removed": {"reason": "deleted"}}"#;
        let message: GraphMessage = serde_json::from_str(json).unwrap();
        assert!(message.is_removed());
    }

    #[test]
    fn test_event_into_item() {
        let json = r#"{
            "id": "ev-1",
            "subject": "Standup",
            "start": {"dateTime": "2024-03-01T09:00:00.0000000", "timeZone": "UTC"},
            "end": {"dateTime": "2024-03-01T09:15:00.0000000", "timeZone": "UTC"},
            "type": "occurrence",
            "seriesMasterId": "ev-master",
            "responseStatus": {"response": "tentativelyAccepted"},
            "attendees": [{"emailAddress": {"address": "a@contoso.com"}, "status": {"response": "accepted"}}]
        }"#;
        let event: GraphEvent = serde_json::from_str(json).unwrap();
        let item = event.into_item("cal");
        assert_eq!(item.kind, CalendarItemKind::Occurrence);
        assert_eq!(item.recurring_parent_id.as_deref(), Some("ev-master"));
        assert_eq!(item.response, ResponseStatus::Tentative);
        assert_eq!(item.end - item.start, 15 * 60);
        assert_eq!(item.attendees[0].response, ResponseStatus::Accepted);
    }
}
