use serde::{Deserialize, Serialize};

pub type AccountId = String;

/// Concrete remote backend an account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Microsoft Graph (Outlook / Office 365)
    Outlook,
    /// Gmail REST API
    Gmail,
    /// Plain IMAP + SMTP
    Imap,
}

/// How a provider reports incremental changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    /// Per-folder opaque delta token, invalidated with HTTP 410.
    DeltaCursor,
    /// One monotonically increasing history id per account.
    HistoryCursor,
    /// Per-folder UIDVALIDITY / HIGHESTMODSEQ over a stateful connection.
    ProtocolUid,
}

impl ProviderKind {
    pub fn family(self) -> ProviderFamily {
        match self {
            ProviderKind::Outlook => ProviderFamily::DeltaCursor,
            ProviderKind::Gmail => ProviderFamily::HistoryCursor,
            ProviderKind::Imap => ProviderFamily::ProtocolUid,
        }
    }

    /// Label providers let one message live in several folders at once.
    pub fn uses_labels(self) -> bool {
        matches!(self, ProviderKind::Gmail)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Outlook => "outlook",
            ProviderKind::Gmail => "gmail",
            ProviderKind::Imap => "imap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outlook" => Some(ProviderKind::Outlook),
            "gmail" => Some(ProviderKind::Gmail),
            "imap" => Some(ProviderKind::Imap),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub address: String,
    pub display_name: Option<String>,
    pub provider: ProviderKind,
    /// Account-wide history cursor (history providers only)
    pub history_cursor: Option<String>,
}

impl Account {
    pub fn new(id: impl Into<String>, address: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            display_name: None,
            provider,
            history_cursor: None,
        }
    }

    pub fn display_name_or_address(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}

/// Profile details reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountProfile {
    pub address: String,
    pub display_name: Option<String>,
}
