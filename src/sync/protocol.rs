//! UID / mod-seq pulls for the IMAP family.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use super::Downloaded;
use crate::cache::ChangeProcessor;
use crate::constants::IMAP_FETCH_BATCH_SIZE;
use crate::error::{SyncError, SyncResult};
use crate::model::{Folder, NewMailPackage, protocol_mail_id};
use crate::provider::ProtocolClient;
use crate::threading::references::assign_thread_ids;

pub(crate) async fn pull_folder(
    client: &dyn ProtocolClient,
    cache: &dyn ChangeProcessor,
    account_id: &str,
    folder: &Folder,
    cancel: &CancellationToken,
) -> SyncResult<Vec<Downloaded>> {
    if cancel.is_cancelled() {
        return Err(SyncError::Canceled);
    }
    let status = client.examine(folder).await?;

    let validity_changed = folder.uid_validity.is_some_and(|v| v != status.uid_validity);
    let mod_seq_regressed = matches!(
        (folder.highest_mod_seq, status.highest_mod_seq),
        (Some(stored), Some(current)) if current < stored
    );
    let reset = validity_changed || mod_seq_regressed;
    if reset {
        let cleared = cache.clear_folder_mail(account_id, folder.id).await?;
        tracing::warn!(
            "{}: {} (validity {:?} -> {}, modseq {:?} -> {:?}), dropped {} cached messages",
            folder.name,
            if validity_changed { "UIDVALIDITY changed" } else { "HIGHESTMODSEQ went backwards" },
            folder.uid_validity,
            status.uid_validity,
            folder.highest_mod_seq,
            status.highest_mod_seq,
            cleared
        );
    } else if let (Some(stored), Some(current)) = (folder.highest_mod_seq, status.highest_mod_seq)
        && current > stored
    {
        let updates = client.fetch_changed_since(folder, stored).await?;
        let mut changed = 0;
        for update in &updates {
            let mail_id = protocol_mail_id(folder.id, update.uid);
            if cache.update_mail_state(account_id, &mail_id, update.state).await? {
                changed += 1;
            }
        }
        tracing::debug!("{}: {} flag changes since modseq {}", folder.name, changed, stored);
    }

    let remote: HashSet<u32> = client.fetch_uids(folder).await?.into_iter().collect();
    let known = if reset {
        HashSet::new()
    } else {
        cache.get_known_protocol_ids(folder.id).await?
    };

    let gone: Vec<u32> = known.difference(&remote).copied().collect();
    if !gone.is_empty() {
        let deleted = cache.delete_protocol_uids(account_id, folder.id, &gone).await?;
        tracing::debug!("{}: {} messages expunged remotely", folder.name, deleted);
    }

    let mut missing: Vec<u32> = remote.difference(&known).copied().collect();
    missing.sort_unstable();

    let mut downloaded = Vec::new();
    for chunk in missing.chunks(IMAP_FETCH_BATCH_SIZE) {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let mut items = client.fetch_headers(folder, chunk).await?;
        assign_thread_ids(cache, account_id, &mut items).await?;
        for item in items {
            let package = NewMailPackage::new(item, folder.remote_id.clone());
            if cache.upsert_mail(account_id, &package).await? {
                downloaded.push(Downloaded {
                    folder_id: folder.id,
                    item: package.item,
                });
            }
        }
    }

    cache
        .update_folder_protocol_state(folder.id, status.uid_validity, status.highest_mod_seq)
        .await?;
    if !folder.initial_sync_completed {
        cache.set_initial_sync_completed(folder.id, true).await?;
    }

    tracing::debug!(
        "{}: {} new, {} removed, {} on server",
        folder.name,
        downloaded.len(),
        gone.len(),
        remote.len()
    );
    Ok(downloaded)
}
