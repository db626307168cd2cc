//! Delta-cursor pulls.
//!
//! The cursor is written after every persisted page, so an interrupted pull
//! resumes from the last stored page and never skips ahead.

use tokio_util::sync::CancellationToken;

use super::Downloaded;
use crate::cache::ChangeProcessor;
use crate::error::{SyncError, SyncResult};
use crate::model::{Calendar, Folder, MailState};
use crate::provider::DeltaClient;

pub(crate) async fn pull_folder(
    client: &dyn DeltaClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folder: &Folder,
    cancel: &CancellationToken,
) -> SyncResult<Vec<Downloaded>> {
    let mut cursor = folder.cursor.clone();
    let mut downloaded = Vec::new();
    let mut pages = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let page = client.pull_folder_changes(folder, cursor.as_deref()).await?;
        pages += 1;

        for package in &page.items {
            let item = &package.item;
            if cache.upsert_mail(account_id, package).await? {
                downloaded.push(Downloaded {
                    folder_id: folder.id,
                    item: item.clone(),
                });
            } else {
                let state = MailState {
                    is_read: item.is_read,
                    is_flagged: item.is_flagged,
                };
                cache.update_mail_state(account_id, &item.id, state).await?;
                cache.create_assignment(account_id, &item.id, &folder.remote_id).await?;
            }
        }
        for remote_id in &page.deletions {
            cache.delete_assignment(account_id, remote_id, &folder.remote_id).await?;
        }

        let Some(next) = page.next_cursor else {
            return Err(SyncError::Protocol(format!(
                "delta page for {} carried no cursor",
                folder.name
            )));
        };
        cache.update_folder_cursor(folder.id, Some(&next)).await?;
        cursor = Some(next);

        tracing::debug!(
            "{}: page {} with {} items, {} deletions",
            folder.name,
            pages,
            page.items.len(),
            page.deletions.len()
        );

        if !page.has_more {
            break;
        }
    }

    if !folder.initial_sync_completed {
        cache.set_initial_sync_completed(folder.id, true).await?;
    }
    Ok(downloaded)
}

/// Same discipline as folders, per calendar. Returns the number of new items.
pub(crate) async fn pull_calendar(
    client: &dyn DeltaClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    calendar: &Calendar,
    cancel: &CancellationToken,
) -> SyncResult<usize> {
    let mut cursor = calendar.cursor.clone();
    let mut created = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let page = client.pull_calendar_changes(calendar, cursor.as_deref()).await?;
        for item in &page.items {
            if cache.upsert_calendar_item(account_id, item).await? {
                created += 1;
            }
        }
        for id in &page.deletions {
            cache.delete_calendar_item(account_id, id).await?;
        }

        let Some(next) = page.next_cursor else {
            return Err(SyncError::Protocol(format!(
                "calendar page for {} carried no cursor",
                calendar.name
            )));
        };
        cache.update_calendar_cursor(calendar.id, Some(&next)).await?;
        cursor = Some(next);

        if !page.has_more {
            break;
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::model::{
        Account, CalendarItem, MailItem, NewMailPackage, ProviderKind, RemoteCalendar, RemoteFolder, SpecialFolder,
    };
    use crate::provider::ChangePage;
    use crate::provider::fake::FakeProvider;

    async fn setup() -> Cache {
        let cache = Cache::open_in_memory().await.unwrap();
        cache
            .ensure_account(&Account::new("acc", "me@contoso.com", ProviderKind::Outlook))
            .await
            .unwrap();
        cache
            .upsert_folders("acc", &[RemoteFolder::new("inbox", "Inbox", SpecialFolder::Inbox)])
            .await
            .unwrap();
        cache
    }

    async fn inbox(cache: &Cache) -> Folder {
        cache.get_folder_by_remote_id("acc", "inbox").await.unwrap().unwrap()
    }

    fn package(id: &str, is_read: bool) -> NewMailPackage {
        let item = MailItem {
            id: id.to_string(),
            remote_id: id.to_string(),
            is_read,
            ..Default::default()
        };
        NewMailPackage::new(item, "inbox")
    }

    fn page(items: Vec<NewMailPackage>, next: &str, has_more: bool) -> SyncResult<ChangePage<NewMailPackage>> {
        Ok(ChangePage {
            items,
            deletions: Vec::new(),
            next_cursor: Some(next.to_string()),
            has_more,
        })
    }

    #[tokio::test]
    async fn test_pages_advance_cursor_in_order() {
        let cache = setup().await;
        let provider = FakeProvider::new();
        provider.push_folder_page("inbox", page(vec![package("a", false)], "next-1", true));
        provider.push_folder_page("inbox", page(vec![package("b", false)], "delta-1", false));

        let folder = inbox(&cache).await;
        let downloaded = pull_folder(&provider, &cache, "acc", &folder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downloaded.len(), 2);
        assert_eq!(
            provider.cursors_seen(),
            vec![
                ("inbox".to_string(), None),
                ("inbox".to_string(), Some("next-1".to_string())),
            ]
        );
        let folder = inbox(&cache).await;
        assert_eq!(folder.cursor.as_deref(), Some("delta-1"));
        assert!(folder.initial_sync_completed);
    }

    #[tokio::test]
    async fn test_interrupted_pull_resumes_from_last_page() {
        let cache = setup().await;
        let provider = FakeProvider::new();
        provider.push_folder_page("inbox", page(vec![package("a", false)], "next-1", true));
        provider.push_folder_page("inbox", Err(SyncError::Transport("reset".to_string())));

        let folder = inbox(&cache).await;
        let err = pull_folder(&provider, &cache, "acc", &folder, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));

        let folder = inbox(&cache).await;
        assert_eq!(folder.cursor.as_deref(), Some("next-1"));
        assert!(!folder.initial_sync_completed);
        assert!(cache.get_mail("acc", "a").await.unwrap().is_some());

        pull_folder(&provider, &cache, "acc", &folder, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(provider.cursors_seen().last().unwrap().1.as_deref(), Some("next-1"));
    }

    #[tokio::test]
    async fn test_known_items_update_state_and_deletions_unassign() {
        let cache = setup().await;
        cache.upsert_mail("acc", &package("a", false)).await.unwrap();
        cache.upsert_mail("acc", &package("b", false)).await.unwrap();

        let provider = FakeProvider::new();
        provider.push_folder_page(
            "inbox",
            Ok(ChangePage {
                items: vec![package("a", true)],
                deletions: vec!["b".to_string()],
                next_cursor: Some("delta-2".to_string()),
                has_more: false,
            }),
        );

        let folder = inbox(&cache).await;
        let downloaded = pull_folder(&provider, &cache, "acc", &folder, &CancellationToken::new())
            .await
            .unwrap();

        assert!(downloaded.is_empty());
        assert!(cache.get_mail("acc", "a").await.unwrap().unwrap().is_read);
        assert!(cache.get_mail("acc", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replayed_page_downloads_nothing() {
        let cache = setup().await;
        let provider = FakeProvider::new();
        provider.push_folder_page("inbox", page(vec![package("a", false)], "delta-1", false));
        let folder = inbox(&cache).await;
        let first = pull_folder(&provider, &cache, "acc", &folder, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Server repeats the page already stored under the current cursor
        provider.push_folder_page("inbox", page(vec![package("a", false)], "delta-1", false));
        let folder = inbox(&cache).await;
        let replayed = pull_folder(&provider, &cache, "acc", &folder, &CancellationToken::new())
            .await
            .unwrap();

        assert!(replayed.is_empty());
        assert_eq!(provider.cursors_seen().last().unwrap().1.as_deref(), Some("delta-1"));
        assert_eq!(inbox(&cache).await.cursor.as_deref(), Some("delta-1"));
        assert_eq!(cache.mail_count("acc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_canceled_before_first_page() {
        let cache = setup().await;
        let provider = FakeProvider::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let folder = inbox(&cache).await;
        let err = pull_folder(&provider, &cache, "acc", &folder, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Canceled));
        assert!(provider.cursors_seen().is_empty());
    }

    #[tokio::test]
    async fn test_calendar_pages_store_events_and_cursor() {
        let cache = setup().await;
        cache
            .upsert_calendars(
                "acc",
                &[RemoteCalendar {
                    remote_id: "cal".to_string(),
                    name: "Calendar".to_string(),
                    is_primary: true,
                }],
            )
            .await
            .unwrap();
        let event = |id: &str| CalendarItem {
            id: id.to_string(),
            calendar_remote_id: "cal".to_string(),
            title: format!("event {}", id),
            start: 1_700_000_000,
            end: 1_700_003_600,
            ..Default::default()
        };

        let provider = FakeProvider::new();
        provider.push_calendar_page(
            "cal",
            Ok(ChangePage {
                items: vec![event("e1"), event("e2")],
                deletions: Vec::new(),
                next_cursor: Some("cal-next".to_string()),
                has_more: true,
            }),
        );
        provider.push_calendar_page(
            "cal",
            Ok(ChangePage {
                items: Vec::new(),
                deletions: vec!["e1".to_string()],
                next_cursor: Some("cal-delta".to_string()),
                has_more: false,
            }),
        );

        let calendar = cache.get_calendars("acc").await.unwrap().remove(0);
        let created = pull_calendar(&provider, &cache, "acc", &calendar, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(created, 2);
        assert!(cache.get_calendar_item("acc", "e1").await.unwrap().is_none());
        assert_eq!(cache.get_calendar_item("acc", "e2").await.unwrap().unwrap().title, "event e2");
        let calendar = cache.get_calendars("acc").await.unwrap().remove(0);
        assert_eq!(calendar.cursor.as_deref(), Some("cal-delta"));
    }
}
