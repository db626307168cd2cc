//! Conversation ids for providers that don't assign them.
//!
//! Links Message-ID / In-Reply-To / References inside a batch with union-find,
//! joins existing local threads by Message-ID, and groups leftover singletons
//! by normalized subject.

use std::collections::HashMap;

use anyhow::Result;

use crate::cache::ChangeProcessor;
use crate::model::MailItem;

/// Fill in `thread_id` for every item in the batch.
pub async fn assign_thread_ids(cache: &dyn ChangeProcessor, account_id: &str, items: &mut [MailItem]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }

    for group in link_batch(items) {
        let mut known_ids: Vec<String> = Vec::new();
        for &i in &group {
            let item = &items[i];
            known_ids.extend(item.message_id.iter().cloned());
            known_ids.extend(item.in_reply_to.iter().cloned());
            known_ids.extend(item.references.iter().cloned());
        }
        known_ids.sort();
        known_ids.dedup();

        let thread_id = match cache.find_thread_id_by_message_ids(account_id, &known_ids).await? {
            Some(existing) => existing,
            None => new_thread_id(items, &group),
        };
        for &i in &group {
            items[i].thread_id = Some(thread_id.clone());
        }
    }
    Ok(())
}

/// Oldest message's Message-ID, falling back to its local id.
fn new_thread_id(items: &[MailItem], group: &[usize]) -> String {
    let root = group
        .iter()
        .min_by_key(|&&i| items[i].date)
        .map(|&i| &items[i]);
    match root {
        Some(item) if group.len() > 1 && has_no_links(item) && item.message_id.is_none() => {
            format!("subj:{}", normalize_subject(&item.subject))
        }
        Some(item) => item.message_id.clone().unwrap_or_else(|| item.id.clone()),
        None => String::new(),
    }
}

fn has_no_links(item: &MailItem) -> bool {
    item.in_reply_to.is_none() && item.references.is_empty()
}

/// Partition batch indices into conversations.
fn link_batch(items: &[MailItem]) -> Vec<Vec<usize>> {
    let by_message_id: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| item.message_id.as_deref().map(|mid| (mid, i)))
        .collect();

    // In-Reply-To wins, then the nearest reference
    let mut parent: Vec<Option<usize>> = vec![None; items.len()];
    for (i, item) in items.iter().enumerate() {
        let candidates = item.in_reply_to.iter().chain(item.references.iter().rev());
        parent[i] = candidates
            .filter_map(|id| by_message_id.get(id.as_str()).copied())
            .find(|&p| p != i && !reaches(&parent, p, i));
    }

    let mut has_children = vec![false; items.len()];
    for p in parent.iter().flatten() {
        has_children[*p] = true;
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut by_subject: HashMap<String, Vec<usize>> = HashMap::new();
    for i in 0..items.len() {
        let root = find_root_compressed(&mut parent, i);
        let isolated = root == i && !has_children[i] && has_no_links(&items[i]);
        if isolated {
            by_subject
                .entry(normalize_subject(&items[i].subject))
                .or_default()
                .push(i);
        } else {
            groups.entry(root).or_default().push(i);
        }
    }

    let mut result: Vec<Vec<usize>> = groups.into_values().collect();
    for (subject, indices) in by_subject {
        if subject.is_empty() {
            result.extend(indices.into_iter().map(|i| vec![i]));
        } else {
            result.push(indices);
        }
    }
    result
}

/// Whether following parents from `from` reaches `target`.
fn reaches(parent: &[Option<usize>], from: usize, target: usize) -> bool {
    let mut current = Some(from);
    let mut steps = 0;
    while let Some(c) = current {
        if c == target {
            return true;
        }
        steps += 1;
        if steps > parent.len() {
            return true;
        }
        current = parent[c];
    }
    false
}

/// Root lookup with path compression.
fn find_root_compressed(parent: &mut [Option<usize>], mut i: usize) -> usize {
    let mut current = i;
    while let Some(p) = parent[current] {
        current = p;
    }
    let root = current;

    while let Some(p) = parent[i] {
        parent[i] = Some(root);
        i = p;
    }

    root
}

/// Strip reply/forward prefixes (Re:, Fwd:, Fw:, Aw:, Sv:, Re[2]:) and lowercase.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_lowercase();
        if lower.starts_with("re:") || lower.starts_with("fw:") || lower.starts_with("aw:") || lower.starts_with("sv:") {
            s = s[3..].trim_start();
        } else if lower.starts_with("fwd:") {
            s = s[4..].trim_start();
        } else if lower.starts_with("re[") {
            match s.find("]:") {
                Some(end) => s = s[end + 2..].trim_start(),
                None => break,
            }
        } else {
            break;
        }
    }
    s.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::model::{Account, NewMailPackage, ProviderKind, RemoteFolder, SpecialFolder};

    fn mail(id: &str, subject: &str, message_id: Option<&str>, in_reply_to: Option<&str>, date: i64) -> MailItem {
        MailItem {
            id: id.to_string(),
            remote_id: id.to_string(),
            subject: subject.to_string(),
            message_id: message_id.map(|s| s.to_string()),
            in_reply_to: in_reply_to.map(|s| s.to_string()),
            date,
            ..Default::default()
        }
    }

    async fn cache() -> Cache {
        let cache = Cache::open_in_memory().await.unwrap();
        cache
            .ensure_account(&Account::new("acc", "me@example.com", ProviderKind::Imap))
            .await
            .unwrap();
        cache
            .upsert_folders("acc", &[RemoteFolder::new("INBOX", "INBOX", SpecialFolder::Inbox)])
            .await
            .unwrap();
        cache
    }

    #[test]
    fn test_normalize_subject() {
        assert_eq!(normalize_subject("Re: Hello"), "hello");
        assert_eq!(normalize_subject("RE: Fwd: Hello"), "hello");
        assert_eq!(normalize_subject("Re[2]: Hello"), "hello");
        assert_eq!(normalize_subject("AW: SV: Hello"), "hello");
        assert_eq!(normalize_subject("Hello"), "hello");
    }

    #[tokio::test]
    async fn test_reply_chain_shares_root_id() {
        let cache = cache().await;
        let mut items = vec![
            mail("1:1", "Plans", Some("<a@x>"), None, 100),
            mail("1:2", "Re: Plans", Some("<b@x>"), Some("<a@x>"), 200),
            mail("1:3", "Re: Plans", Some("<c@x>"), Some("<b@x>"), 300),
            mail("1:4", "Other", Some("<d@x>"), None, 150),
        ];
        assign_thread_ids(&cache, "acc", &mut items).await.unwrap();

        assert_eq!(items[0].thread_id.as_deref(), Some("<a@x>"));
        assert_eq!(items[1].thread_id, items[0].thread_id);
        assert_eq!(items[2].thread_id, items[0].thread_id);
        assert_eq!(items[3].thread_id.as_deref(), Some("<d@x>"));
    }

    #[tokio::test]
    async fn test_reply_joins_existing_local_thread() {
        let cache = cache().await;
        let mut original = mail("1:1", "Plans", Some("<a@x>"), None, 100);
        original.thread_id = Some("thread-a".to_string());
        cache
            .upsert_mail("acc", &NewMailPackage::new(original, "INBOX"))
            .await
            .unwrap();

        let mut items = vec![mail("1:9", "Re: Plans", Some("<z@x>"), Some("<a@x>"), 900)];
        assign_thread_ids(&cache, "acc", &mut items).await.unwrap();
        assert_eq!(items[0].thread_id.as_deref(), Some("thread-a"));
    }

    #[tokio::test]
    async fn test_subject_fallback_for_headerless_mail() {
        let cache = cache().await;
        let mut items = vec![
            mail("1:1", "Weekly report", None, None, 100),
            mail("1:2", "RE: Weekly report", None, None, 200),
        ];
        assign_thread_ids(&cache, "acc", &mut items).await.unwrap();
        assert_eq!(items[0].thread_id.as_deref(), Some("subj:weekly report"));
        assert_eq!(items[1].thread_id, items[0].thread_id);
    }

    #[test]
    fn test_reference_cycles_terminate() {
        let items = vec![
            mail("1", "x", Some("<a@x>"), Some("<b@x>"), 1),
            mail("2", "x", Some("<b@x>"), Some("<a@x>"), 2),
        ];
        let groups = link_batch(&items);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }
}
