//! History-cursor pulls.
//!
//! The account has one history id. Without one, the pull enumerates every
//! synchronized label and stores the id captured before enumeration started,
//! so nothing that changes during the download is lost. With one, history
//! pages are replayed onto the cache.

use std::collections::HashSet;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::Downloaded;
use crate::cache::ChangeProcessor;
use crate::constants::GMAIL_DOWNLOAD_CHUNK;
use crate::error::{SyncError, SyncResult};
use crate::model::{Folder, NewMailPackage, SpecialFolder};
use crate::provider::{HistoryChange, HistoryClient};

pub(crate) async fn pull(
    client: &dyn HistoryClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folders: &[Folder],
    cancel: &CancellationToken,
) -> SyncResult<Vec<Downloaded>> {
    let mut downloaded = drain_retry_queue(client, cache, account_id, folders).await?;

    let cursor = cache.get_account(account_id).await?.and_then(|a| a.history_cursor);
    match cursor {
        None => downloaded.extend(initial_sync(client, cache, account_id, folders, cancel).await?),
        Some(cursor) => {
            downloaded.extend(incremental_sync(client, cache, account_id, folders, &cursor, cancel).await?)
        }
    }
    Ok(downloaded)
}

async fn initial_sync(
    client: &dyn HistoryClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folders: &[Folder],
    cancel: &CancellationToken,
) -> SyncResult<Vec<Downloaded>> {
    let captured = client.current_history_id().await?;
    tracing::info!("Initial sync for {} at history {}", account_id, captured);

    let mut seen: HashSet<String> = HashSet::new();
    let mut downloaded = Vec::new();

    for folder in folders {
        let mut page_token: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            let page = client.list_message_ids(&folder.remote_id, page_token.as_deref()).await?;
            let fresh: Vec<String> = page.ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
            downloaded.extend(download(client, cache, account_id, folders, &fresh).await?);

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        if !folder.initial_sync_completed {
            cache.set_initial_sync_completed(folder.id, true).await?;
        }
    }

    cache.update_account_cursor(account_id, Some(&captured)).await?;
    tracing::info!("Initial sync for {} stored {} messages", account_id, downloaded.len());
    Ok(downloaded)
}

async fn incremental_sync(
    client: &dyn HistoryClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folders: &[Folder],
    cursor: &str,
    cancel: &CancellationToken,
) -> SyncResult<Vec<Downloaded>> {
    let mut downloaded = Vec::new();
    let mut page_token: Option<String> = None;
    let mut latest: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let page = client.pull_history(cursor, page_token.as_deref()).await?;
        tracing::debug!("History page for {}: {} changes", account_id, page.changes.len());

        let mut to_download: Vec<String> = Vec::new();
        for change in page.changes {
            apply_change(cache, account_id, change, &mut to_download).await?;
        }
        downloaded.extend(download(client, cache, account_id, folders, &to_download).await?);

        if page.history_id.is_some() {
            latest = page.history_id;
        }
        page_token = page.next_page_token;
        if page_token.is_none() {
            break;
        }
    }

    if let Some(latest) = latest
        && is_newer(&latest, cursor)
    {
        cache.update_account_cursor(account_id, Some(&latest)).await?;
    }
    Ok(downloaded)
}

async fn apply_change(
    cache: &dyn ChangeProcessor,
    account_id: &str,
    change: HistoryChange,
    to_download: &mut Vec<String>,
) -> SyncResult<()> {
    match change {
        HistoryChange::MessageAdded { id } => {
            if cache.get_mail(account_id, &id).await?.is_none() && !to_download.contains(&id) {
                to_download.push(id);
            }
        }
        HistoryChange::MessageDeleted { id } => {
            to_download.retain(|pending| *pending != id);
            cache.delete_mail(account_id, &id).await?;
        }
        HistoryChange::LabelsAdded { id, labels } => {
            if to_download.contains(&id) {
                return Ok(());
            }
            if cache.get_mail(account_id, &id).await?.is_none() {
                to_download.push(id);
                return Ok(());
            }
            for label in &labels {
                cache.create_assignment(account_id, &id, label).await?;
            }
        }
        HistoryChange::LabelsRemoved { id, labels } => {
            if to_download.contains(&id) {
                return Ok(());
            }
            for label in &labels {
                cache.delete_assignment(account_id, &id, label).await?;
            }
        }
        HistoryChange::ReadChanged { id, is_read } => cache.set_read_status(account_id, &id, is_read).await?,
        HistoryChange::FlagChanged { id, is_flagged } => cache.set_flag_status(account_id, &id, is_flagged).await?,
    }
    Ok(())
}

/// Download and store `ids` in chunks. Failed ids go to the retry queue.
async fn download(
    client: &dyn HistoryClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folders: &[Folder],
    ids: &[String],
) -> SyncResult<Vec<Downloaded>> {
    let mut downloaded = Vec::new();
    for chunk in ids.chunks(GMAIL_DOWNLOAD_CHUNK) {
        for (id, result) in client.get_messages(chunk).await {
            match result {
                Ok(package) => downloaded.extend(store(cache, account_id, folders, package).await?),
                Err(e) if e.is_definitive() => {
                    tracing::debug!("Skipping {}: {}", id, e);
                }
                Err(e) => {
                    tracing::warn!("Download of {} failed, queued for retry: {}", id, e);
                    cache.enqueue_retry(account_id, &id, Utc::now().timestamp()).await?;
                }
            }
        }
    }
    Ok(downloaded)
}

async fn store(
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folders: &[Folder],
    package: NewMailPackage,
) -> SyncResult<Option<Downloaded>> {
    if !cache.upsert_mail(account_id, &package).await? {
        return Ok(None);
    }
    Ok(home_folder(folders, &package).map(|folder| Downloaded {
        folder_id: folder.id,
        item: package.item,
    }))
}

/// The folder a labeled message is shown under; All Mail only as a last resort.
fn home_folder<'a>(folders: &'a [Folder], package: &NewMailPackage) -> Option<&'a Folder> {
    let labeled = || {
        folders
            .iter()
            .filter(|f| package.folder_remote_ids.contains(&f.remote_id))
    };
    labeled()
        .find(|f| !matches!(f.special, SpecialFolder::Archive | SpecialFolder::Category))
        .or_else(|| labeled().next())
}

async fn drain_retry_queue(
    client: &dyn HistoryClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folders: &[Folder],
) -> SyncResult<Vec<Downloaded>> {
    let now = Utc::now().timestamp();
    let mut entries = Vec::new();
    for entry in cache.get_retry_queue(account_id).await? {
        if entry.is_expired(now) {
            cache.remove_retry(entry.id).await?;
        } else {
            entries.push(entry);
        }
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    tracing::debug!("Retrying {} queued downloads for {}", entries.len(), account_id);
    let ids: Vec<String> = entries.iter().map(|e| e.remote_id.clone()).collect();
    let mut downloaded = Vec::new();
    for (id, result) in client.get_messages(&ids).await {
        let Some(entry) = entries.iter().find(|e| e.remote_id == id) else {
            continue;
        };
        match result {
            Ok(package) => {
                downloaded.extend(store(cache, account_id, folders, package).await?);
                cache.remove_retry(entry.id).await?;
            }
            Err(e) if e.is_definitive() => cache.remove_retry(entry.id).await?,
            Err(_) => cache.increment_retry_failure(entry.id).await?,
        }
    }
    Ok(downloaded)
}

/// History ids are decimal; never move the cursor backwards.
fn is_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(candidate), Ok(current)) => candidate > current,
        _ => candidate != current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::model::{Account, MailItem, ProviderKind, RemoteFolder};
    use crate::provider::HistoryPage;
    use crate::provider::fake::FakeProvider;

    async fn setup() -> (Cache, Vec<Folder>) {
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
                ],
            )
            .await
            .unwrap();
        let folders = cache.get_folders("acc").await.unwrap();
        (cache, folders)
    }

    fn message(id: &str, labels: &[&str]) -> NewMailPackage {
        NewMailPackage {
            item: MailItem {
                id: id.to_string(),
                remote_id: id.to_string(),
                thread_id: Some(format!("t-{}", id)),
                ..Default::default()
            },
            folder_remote_ids: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    async fn cursor(cache: &Cache) -> Option<String> {
        cache.get_account("acc").await.unwrap().unwrap().history_cursor
    }

    #[tokio::test]
    async fn test_initial_sync_stores_captured_history_id() {
        let (cache, folders) = setup().await;
        let provider = FakeProvider::new();
        provider.set_history_id("100");
        provider.add_message(message("m1", &["INBOX"]));
        provider.add_message(message("m2", &["INBOX", "SENT"]));

        let downloaded = pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(downloaded.len(), 2);
        assert_eq!(cursor(&cache).await.as_deref(), Some("100"));
        assert_eq!(cache.mail_count("acc").await.unwrap(), 2);
        assert!(provider.history_starts().is_empty());
    }

    #[tokio::test]
    async fn test_incremental_sync_replays_history() {
        let (cache, folders) = setup().await;
        let provider = FakeProvider::new();
        provider.set_history_id("100");
        provider.add_message(message("m1", &["INBOX"]));
        provider.add_message(message("m2", &["SENT"]));
        pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();

        provider.add_message(message("m3", &["INBOX"]));
        provider.push_history_page(Ok(HistoryPage {
            changes: vec![
                HistoryChange::MessageAdded { id: "m3".to_string() },
                HistoryChange::MessageDeleted { id: "m1".to_string() },
                HistoryChange::ReadChanged {
                    id: "m2".to_string(),
                    is_read: true,
                },
                HistoryChange::LabelsAdded {
                    id: "m2".to_string(),
                    labels: vec!["INBOX".to_string()],
                },
            ],
            next_page_token: None,
            history_id: Some("105".to_string()),
        }));

        let downloaded = pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.history_starts(), vec!["100".to_string()]);
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[0].item.id, "m3");
        assert!(cache.get_mail("acc", "m1").await.unwrap().is_none());
        assert!(cache.get_mail("acc", "m2").await.unwrap().unwrap().is_read);
        let labels: Vec<String> = cache
            .get_assignments("acc", "m2")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.remote_id)
            .collect();
        assert!(labels.contains(&"INBOX".to_string()));
        assert_eq!(cursor(&cache).await.as_deref(), Some("105"));
    }

    #[tokio::test]
    async fn test_failed_download_is_retried_next_pull() {
        let (cache, folders) = setup().await;
        let provider = FakeProvider::new();
        provider.add_message(message("m1", &["INBOX"]));
        provider.add_message(message("m2", &["INBOX"]));
        provider.fail_download("m2");

        pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();
        assert!(cache.get_mail("acc", "m2").await.unwrap().is_none());
        assert_eq!(cache.get_retry_queue("acc").await.unwrap().len(), 1);

        // Still failing: the entry stays with one more failure
        pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();
        let queue = cache.get_retry_queue("acc").await.unwrap();
        assert_eq!(queue[0].failed_count, 1);

        provider.heal_download("m2");
        let downloaded = pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(downloaded.len(), 1);
        assert!(cache.get_mail("acc", "m2").await.unwrap().is_some());
        assert!(cache.get_retry_queue("acc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let (cache, folders) = setup().await;
        cache.update_account_cursor("acc", Some("100")).await.unwrap();
        let provider = FakeProvider::new();
        provider.push_history_page(Ok(HistoryPage {
            changes: Vec::new(),
            next_page_token: None,
            history_id: Some("90".to_string()),
        }));

        pull(&provider, &cache, "acc", &folders, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cursor(&cache).await.as_deref(), Some("100"));
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("101", "100"));
        assert!(!is_newer("99", "100"));
        assert!(!is_newer("100", "100"));
        assert!(is_newer("abc", "100"));
    }
}
