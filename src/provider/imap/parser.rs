use async_imap::types::{Fetch, Flag, NameAttribute};
use bitflags::bitflags;
use mail_parser::{MessageParser, PartType};

use crate::constants::PREVIEW_LENGTH;
use crate::model::{FolderId, MailItem, MailState, SpecialFolder, protocol_mail_id};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const SEEN = 0b00001;
        const ANSWERED = 0b00010;
        const FLAGGED = 0b00100;
        const DELETED = 0b01000;
        const DRAFT = 0b10000;
    }
}

impl MessageFlags {
    pub fn from_imap(flags: &[Flag<'_>]) -> Self {
        let mut result = MessageFlags::empty();
        for flag in flags {
            match flag {
                Flag::Seen => result |= MessageFlags::SEEN,
                Flag::Answered => result |= MessageFlags::ANSWERED,
                Flag::Flagged => result |= MessageFlags::FLAGGED,
                Flag::Deleted => result |= MessageFlags::DELETED,
                Flag::Draft => result |= MessageFlags::DRAFT,
                _ => {}
            }
        }
        result
    }

    pub fn state(self) -> MailState {
        MailState {
            is_read: self.contains(MessageFlags::SEEN),
            is_flagged: self.contains(MessageFlags::FLAGGED),
        }
    }
}

/// Folder role from RFC 6154 SPECIAL-USE attributes.
pub fn special_from_attributes(attributes: &[NameAttribute<'_>]) -> Option<SpecialFolder> {
    attributes.iter().find_map(|attr| match attr {
        NameAttribute::Sent => Some(SpecialFolder::Sent),
        NameAttribute::Drafts => Some(SpecialFolder::Draft),
        NameAttribute::Trash => Some(SpecialFolder::Trash),
        NameAttribute::Junk => Some(SpecialFolder::Junk),
        NameAttribute::Archive => Some(SpecialFolder::Archive),
        _ => None,
    })
}

pub fn is_selectable(attributes: &[NameAttribute<'_>]) -> bool {
    !attributes.iter().any(|a| matches!(a, NameAttribute::NoSelect))
}

/// Build a mail item from a `UID FLAGS BODY.PEEK[HEADER] BODY.PEEK[TEXT]<0.n>` response.
pub fn parse_fetch(folder_id: FolderId, folder_remote_id: &str, fetch: &Fetch) -> Option<MailItem> {
    let uid = fetch.uid?;
    let flags: Vec<Flag> = fetch.flags().collect();
    let flags = MessageFlags::from_imap(&flags);

    let header_bytes = fetch.header()?;
    let body_preview = fetch.text().unwrap_or(&[]);

    let mut raw = Vec::with_capacity(header_bytes.len() + 4 + body_preview.len());
    raw.extend_from_slice(header_bytes);
    raw.extend_from_slice(b"\r\n\r\n");
    raw.extend_from_slice(body_preview);

    let mut item = parse_header(&raw)?;
    item.id = protocol_mail_id(folder_id, uid);
    item.remote_id = uid.to_string();
    item.uid = Some(uid);
    item.is_read = flags.contains(MessageFlags::SEEN);
    item.is_flagged = flags.contains(MessageFlags::FLAGGED);
    item.is_draft = flags.contains(MessageFlags::DRAFT);
    item.mime_ref = Some(format!("{}/{}", folder_remote_id, uid));
    Some(item)
}

/// Header fields of a message; identity and flags are filled in by the caller.
pub fn parse_header(raw: &[u8]) -> Option<MailItem> {
    let message = MessageParser::default().parse(raw)?;

    let (from_address, from_name) = message
        .from()
        .and_then(|a| a.first())
        .map(|from| {
            (
                from.address().unwrap_or_default().to_string(),
                from.name().map(|s| s.to_string()),
            )
        })
        .unwrap_or_default();

    let in_reply_to = message
        .in_reply_to()
        .as_text_list()
        .and_then(|ids| ids.first().map(|s| normalize_message_id(s)));

    let references: Vec<String> = message
        .references()
        .as_text_list()
        .map(|ids| ids.iter().map(|s| normalize_message_id(s)).collect())
        .unwrap_or_default();

    Some(MailItem {
        message_id: message.message_id().map(normalize_message_id),
        in_reply_to,
        references,
        subject: message.subject().map(|s| s.to_string()).unwrap_or_default(),
        from_address,
        from_name,
        date: message.date().map(|d| d.to_timestamp()).unwrap_or_default(),
        preview: extract_preview(&message, PREVIEW_LENGTH),
        ..Default::default()
    })
}

/// mail-parser strips angle brackets; stored ids keep them.
fn normalize_message_id(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{}>", id)
    }
}

fn extract_preview(message: &mail_parser::Message, max_len: usize) -> Option<String> {
    let text = message
        .text_bodies()
        .find_map(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        })
        .or_else(|| {
            message.html_bodies().find_map(|part| match &part.body {
                PartType::Html(html) => html2text::from_read(html.as_bytes(), 200).ok(),
                _ => None,
            })
        })?;

    let preview: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_len)
        .collect();

    (!preview.is_empty()).then_some(preview)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_with_threading() {
        let raw = b"From: Alice <alice@example.com>\r\n\
                    To: bob@example.com\r\n\
                    Subject: Re: Plans\r\n\
                    Date: Mon, 1 Jan 2024 12:00:00 +0000\r\n\
                    Message-ID: <r2@example.com>\r\n\
                    In-Reply-To: <r1@example.com>\r\n\
                    References: <r0@example.com> <r1@example.com>\r\n\
                    \r\n\
                    Sounds   good,\r\nsee you.";

        let item = parse_header(raw).unwrap();
        assert_eq!(item.subject, "Re: Plans");
        assert_eq!(item.from_address, "alice@example.com");
        assert_eq!(item.from_name.as_deref(), Some("Alice"));
        assert_eq!(item.message_id.as_deref(), Some("<r2@example.com>"));
        assert_eq!(item.in_reply_to.as_deref(), Some("<r1@example.com>"));
        assert_eq!(item.references, vec!["<r0@example.com>", "<r1@example.com>"]);
        assert_eq!(item.date, 1_704_110_400);
        assert_eq!(item.preview.as_deref(), Some("Sounds good, see you."));
    }

    #[test]
    fn test_html_preview_fallback() {
        let raw = b"From: a@example.com\r\n\
                    Subject: News\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>Hello <b>world</b></p>";
        let item = parse_header(raw).unwrap();
        assert!(item.preview.unwrap().contains("Hello"));
    }

    #[test]
    fn test_flags_state() {
        let flags = MessageFlags::from_imap(&[Flag::Seen, Flag::Flagged]);
        assert_eq!(
            flags.state(),
            MailState {
                is_read: true,
                is_flagged: true
            }
        );
        assert!(!MessageFlags::from_imap(&[]).state().is_read);
    }

    #[test]
    fn test_special_use_attributes() {
        assert_eq!(
            special_from_attributes(&[NameAttribute::Marked, NameAttribute::Sent]),
            Some(SpecialFolder::Sent)
        );
        assert!(!is_selectable(&[NameAttribute::NoSelect]));
    }
}
