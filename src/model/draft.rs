use anyhow::{Context, Result};
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;

use super::mail::MailItem;
use crate::constants::PREVIEW_LENGTH;

/// A locally composed message, saved as a draft or sent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Draft {
    /// Local id; becomes the Message-ID local part
    pub local_id: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// Provider thread to attach to (reply drafts)
    pub thread_id: Option<String>,
    /// Date as a unix timestamp
    pub date: i64,
}

impl Draft {
    pub fn message_id(&self) -> String {
        let domain = self
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        format!("<{}@{}>", self.local_id, domain)
    }

    pub fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(self.cc.iter())
    }

    pub fn to_message(&self) -> Result<Message> {
        let from = match &self.from_name {
            Some(name) => format!("{} <{}>", name, self.from_address),
            None => self.from_address.clone(),
        };
        let mut builder = Message::builder()
            .from(from.parse::<Mailbox>().context("Invalid from address")?)
            .subject(&self.subject)
            .message_id(Some(self.message_id()));

        for addr in self.to.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            builder = builder.to(addr
                .parse::<Mailbox>()
                .with_context(|| format!("Invalid recipient address: {}", addr))?);
        }
        for addr in self.cc.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            builder = builder.cc(addr
                .parse::<Mailbox>()
                .with_context(|| format!("Invalid CC address: {}", addr))?);
        }
        if let Some(reply_to) = &self.in_reply_to {
            builder = builder.in_reply_to(reply_to.clone());
        }
        if !self.references.is_empty() {
            builder = builder.references(self.references.join(" "));
        }

        builder
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.clone())
            .context("Failed to build message")
    }

    /// RFC 5322 bytes for raw uploads and IMAP APPEND.
    pub fn to_mime(&self) -> Result<Vec<u8>> {
        Ok(self.to_message()?.formatted())
    }

    /// The local item this draft will become once the server acknowledges it.
    pub fn to_mail_item(&self, is_draft: bool) -> MailItem {
        let preview: String = self.body.chars().take(PREVIEW_LENGTH).collect();
        MailItem {
            id: self.local_id.clone(),
            remote_id: self.local_id.clone(),
            thread_id: self.thread_id.clone(),
            message_id: Some(self.message_id()),
            in_reply_to: self.in_reply_to.clone(),
            references: self.references.clone(),
            subject: self.subject.clone(),
            from_address: self.from_address.clone(),
            from_name: self.from_name.clone(),
            date: self.date,
            preview: Some(preview.trim().to_string()).filter(|p| !p.is_empty()),
            is_read: true,
            is_draft,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> Draft {
        Draft {
            local_id: "d1".to_string(),
            from_address: "me@example.com".to_string(),
            from_name: Some("Me".to_string()),
            to: vec!["you@example.com".to_string(), " ".to_string()],
            subject: "Hello".to_string(),
            body: "Body text".to_string(),
            in_reply_to: Some("<orig@example.com>".to_string()),
            references: vec!["<orig@example.com>".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_mime_contains_threading_headers() {
        let mime = String::from_utf8(draft().to_mime().unwrap()).unwrap();
        assert!(mime.contains("Subject: Hello"));
        assert!(mime.contains("Message-ID: <d1@example.com>"));
        assert!(mime.contains("In-Reply-To: <orig@example.com>"));
    }

    #[test]
    fn test_invalid_recipient_is_error() {
        let mut d = draft();
        d.to = vec!["not an address".to_string()];
        assert!(d.to_mime().is_err());
    }

    #[test]
    fn test_mail_item_template() {
        let item = draft().to_mail_item(true);
        assert!(item.is_draft);
        assert_eq!(item.message_id.as_deref(), Some("<d1@example.com>"));
        assert_eq!(item.preview.as_deref(), Some("Body text"));
    }
}
