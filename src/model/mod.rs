//! Domain types shared by the cache, the providers and the synchronizers.

pub mod account;
pub mod calendar;
pub mod draft;
pub mod folder;
pub mod mail;
pub mod retry;

pub use account::{Account, AccountId, AccountProfile, ProviderFamily, ProviderKind};
pub use calendar::{
    Attendee, Calendar, CalendarId, CalendarItem, CalendarItemKind, RemoteCalendar,
    ResponseStatus,
};
pub use draft::Draft;
pub use folder::{Folder, FolderDiff, FolderId, RemoteFolder, SpecialFolder};
pub use mail::{MailCopy, MailId, MailItem, MailSnapshot, MailState, NewMailPackage, protocol_mail_id};
pub use retry::RetryQueueEntry;
