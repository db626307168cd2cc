use super::account::AccountId;

pub type CalendarId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calendar {
    pub id: CalendarId,
    pub account_id: AccountId,
    pub remote_id: String,
    pub name: String,
    pub is_primary: bool,
    /// Opaque delta cursor for this calendar's events
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCalendar {
    pub remote_id: String,
    pub name: String,
    pub is_primary: bool,
}

/// Position of an event within a recurrence series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalendarItemKind {
    #[default]
    Single,
    /// The series master carrying the recurrence rule
    Master,
    Occurrence,
    /// An occurrence that was modified independently of its master
    Exception,
}

impl CalendarItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CalendarItemKind::Single => "single",
            CalendarItemKind::Master => "master",
            CalendarItemKind::Occurrence => "occurrence",
            CalendarItemKind::Exception => "exception",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "master" => CalendarItemKind::Master,
            "occurrence" => CalendarItemKind::Occurrence,
            "exception" => CalendarItemKind::Exception,
            _ => CalendarItemKind::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseStatus {
    #[default]
    None,
    Organizer,
    Accepted,
    Tentative,
    Declined,
    NotResponded,
}

impl ResponseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseStatus::None => "none",
            ResponseStatus::Organizer => "organizer",
            ResponseStatus::Accepted => "accepted",
            ResponseStatus::Tentative => "tentative",
            ResponseStatus::Declined => "declined",
            ResponseStatus::NotResponded => "notResponded",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "organizer" => ResponseStatus::Organizer,
            "accepted" => ResponseStatus::Accepted,
            "tentativelyAccepted" | "tentative" => ResponseStatus::Tentative,
            "declined" => ResponseStatus::Declined,
            "notResponded" => ResponseStatus::NotResponded,
            _ => ResponseStatus::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub address: String,
    pub name: Option<String>,
    pub response: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CalendarItem {
    /// Remote event id (also the local identity)
    pub id: String,
    pub calendar_remote_id: String,
    pub title: String,
    pub start: i64,
    pub end: i64,
    pub all_day: bool,
    pub location: Option<String>,
    pub recurrence_rule: Option<String>,
    pub organizer: Option<String>,
    pub recurring_parent_id: Option<String>,
    pub kind: CalendarItemKind,
    /// The account owner's own response
    pub response: ResponseStatus,
    pub attendees: Vec<Attendee>,
}
