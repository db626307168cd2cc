//! Conversation grouping for freshly synchronized mail.

pub mod references;

use std::collections::HashMap;

use anyhow::Result;

use crate::cache::ChangeProcessor;
use crate::model::{FolderId, MailCopy, MailItem, SpecialFolder};

/// A conversation with at least two visible messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailThread {
    pub thread_id: String,
    /// Folder the thread was assembled for
    pub folder_id: FolderId,
    /// Oldest first
    pub items: Vec<MailCopy>,
}

impl MailThread {
    pub fn latest(&self) -> Option<&MailCopy> {
        self.items.last()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadedItem {
    Single(MailItem),
    Thread(MailThread),
}

pub struct ThreadingStrategy<'a> {
    cache: &'a dyn ChangeProcessor,
}

impl<'a> ThreadingStrategy<'a> {
    pub fn new(cache: &'a dyn ChangeProcessor) -> Self {
        Self { cache }
    }

    /// Group items fetched for `folder_id` by thread id.
    ///
    /// Threads pull in their other messages from the same folder plus the
    /// account's Sent and Draft folders. A message assigned to several of
    /// those folders appears once, preferring the copy in `folder_id`.
    pub async fn thread_items(&self, account_id: &str, folder_id: FolderId, items: Vec<MailItem>) -> Result<Vec<ThreadedItem>> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<MailItem>> = HashMap::new();
        let mut result = Vec::new();

        for item in items {
            match item.thread_id.clone() {
                Some(thread_id) => {
                    if !groups.contains_key(&thread_id) {
                        order.push(thread_id.clone());
                    }
                    groups.entry(thread_id).or_default().push(item);
                }
                None => result.push(ThreadedItem::Single(item)),
            }
        }

        let scope = self.thread_scope(account_id, folder_id).await?;

        for thread_id in order {
            let Some(mut members) = groups.remove(&thread_id) else {
                continue;
            };
            if members.len() == 1 {
                result.extend(members.pop().map(ThreadedItem::Single));
                continue;
            }

            let copies = self.cache.get_thread_items(account_id, &thread_id, &scope).await?;
            let mut copies = deduplicate(copies, folder_id);
            match copies.len() {
                0 => result.extend(members.into_iter().map(ThreadedItem::Single)),
                1 => result.extend(copies.pop().map(|c| ThreadedItem::Single(c.item))),
                _ => result.push(ThreadedItem::Thread(MailThread {
                    thread_id,
                    folder_id,
                    items: copies,
                })),
            }
        }

        Ok(result)
    }

    async fn thread_scope(&self, account_id: &str, folder_id: FolderId) -> Result<Vec<FolderId>> {
        let mut scope = vec![folder_id];
        for special in [SpecialFolder::Sent, SpecialFolder::Draft] {
            if let Some(folder) = self.cache.get_special_folder(account_id, special).await?
                && !scope.contains(&folder.id)
            {
                scope.push(folder.id);
            }
        }
        Ok(scope)
    }
}

/// One copy per mail id, keeping the one assigned to `folder_id` when present.
fn deduplicate(copies: Vec<MailCopy>, folder_id: FolderId) -> Vec<MailCopy> {
    let mut unique: Vec<MailCopy> = Vec::with_capacity(copies.len());
    for copy in copies {
        match unique.iter_mut().find(|c| c.item.id == copy.item.id) {
            Some(existing) => {
                if existing.folder_id != folder_id && copy.folder_id == folder_id {
                    *existing = copy;
                }
            }
            None => unique.push(copy),
        }
    }
    unique.sort_by_key(|c| c.item.date);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::model::{Account, NewMailPackage, ProviderKind, RemoteFolder};

    async fn setup() -> Cache {
        let cache = Cache::open_in_memory().await.unwrap();
        cache
            .ensure_account(&Account::new("acc", "me@gmail.com", ProviderKind::Gmail))
            .await
            .unwrap();
        cache
            .upsert_folders(
                "acc",
                &[
                    RemoteFolder::new("INBOX", "Inbox", SpecialFolder::Inbox),
                    RemoteFolder::new("SENT", "Sent", SpecialFolder::Sent),
                    RemoteFolder::new("DRAFT", "Drafts", SpecialFolder::Draft),
                    RemoteFolder::new("ALL_MAIL", "All Mail", SpecialFolder::Archive),
                    RemoteFolder::new("Work", "Work", SpecialFolder::Other),
                ],
            )
            .await
            .unwrap();
        cache
    }

    fn mail(id: &str, thread: &str, date: i64) -> MailItem {
        MailItem {
            id: id.to_string(),
            remote_id: id.to_string(),
            thread_id: Some(thread.to_string()),
            date,
            ..Default::default()
        }
    }

    async fn store(cache: &Cache, item: &MailItem, labels: &[&str]) {
        let package = NewMailPackage {
            item: item.clone(),
            folder_remote_ids: labels.iter().map(|l| l.to_string()).collect(),
        };
        cache.upsert_mail("acc", &package).await.unwrap();
    }

    async fn folder(cache: &Cache, remote_id: &str) -> FolderId {
        cache.get_folder_by_remote_id("acc", remote_id).await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn test_single_item_is_not_a_thread() {
        let cache = setup().await;
        let inbox = folder(&cache, "INBOX").await;
        let item = mail("m1", "t1", 1);
        store(&cache, &item, &["INBOX"]).await;

        let result = ThreadingStrategy::new(&cache)
            .thread_items("acc", inbox, vec![item.clone()])
            .await
            .unwrap();
        assert_eq!(result, vec![ThreadedItem::Single(item)]);
    }

    #[tokio::test]
    async fn test_thread_prefers_copy_in_target_folder() {
        let cache = setup().await;
        let inbox = folder(&cache, "INBOX").await;
        let m1 = mail("m1", "t1", 1);
        let m2 = mail("m2", "t1", 2);
        let m3 = mail("m3", "t1", 3);
        // Sent to self: lives in both Inbox and Sent
        store(&cache, &m1, &["INBOX", "SENT", "ALL_MAIL"]).await;
        store(&cache, &m2, &["SENT", "ALL_MAIL"]).await;
        // Outside the thread scope
        store(&cache, &m3, &["Work", "ALL_MAIL"]).await;

        let result = ThreadingStrategy::new(&cache)
            .thread_items("acc", inbox, vec![m1.clone(), m2.clone()])
            .await
            .unwrap();

        let [ThreadedItem::Thread(thread)] = result.as_slice() else {
            panic!("expected one thread, got {:?}", result);
        };
        let ids: Vec<&str> = thread.items.iter().map(|c| c.item.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(thread.items[0].folder_id, inbox);
        assert_eq!(thread.items[0].folder_special, SpecialFolder::Inbox);
        assert_eq!(thread.latest().map(|c| c.item.id.as_str()), Some("m2"));
    }

    #[tokio::test]
    async fn test_thread_collapsing_to_one_copy_is_single() {
        let cache = setup().await;
        let inbox = folder(&cache, "INBOX").await;
        let m1 = mail("m1", "t1", 1);
        let m2 = mail("m2", "t1", 2);
        store(&cache, &m1, &["INBOX", "SENT"]).await;
        // m2 only exists outside the scope
        store(&cache, &m2, &["Work"]).await;

        let result = ThreadingStrategy::new(&cache)
            .thread_items("acc", inbox, vec![m1.clone(), m2])
            .await
            .unwrap();
        assert_eq!(result, vec![ThreadedItem::Single(m1)]);
    }
}
