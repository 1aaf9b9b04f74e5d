//! Guards that link existing counterparts instead of creating a second copy.
//!
//! Every creation decision runs through one of these first. They only look at
//! data already fetched for the cycle and never call out.

use crate::models::{LocalTask, RemoteTask};
use crate::store::{MappingStore, PendingImport};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

/// Title key used for duplicate detection: trimmed, inner whitespace
/// collapsed, lowercased.
pub fn canon_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn matches_any(title: &str, keys: &[String]) -> bool {
    let canon = canon_title(title);
    !canon.is_empty() && keys.iter().any(|key| *key == canon)
}

pub fn title_keys(titles: &[&str]) -> Vec<String> {
    let mut keys: Vec<String> = titles
        .iter()
        .map(|t| canon_title(t))
        .filter(|k| !k.is_empty())
        .collect();
    keys.dedup();
    keys
}

/// A remote import still waiting for its local task, matched by title.
pub fn matching_pending<'a>(
    mappings: &'a MappingStore,
    keys: &[String],
) -> Option<&'a PendingImport> {
    mappings
        .pending_imports()
        .find(|pending| matches_any(&pending.expected_title, keys))
}

/// An incomplete remote task in `list_id` that nothing maps or claims yet.
pub fn unmapped_remote<'a>(
    remotes: &'a [RemoteTask],
    mappings: &MappingStore,
    touched: &HashSet<String>,
    list_id: &str,
    keys: &[String],
) -> Option<&'a RemoteTask> {
    remotes.iter().find(|remote| {
        remote.list_id == list_id
            && !remote.completed
            && mappings.by_remote(&remote.remote_id).is_none()
            && mappings.pending(&remote.remote_id).is_none()
            && !touched.contains(&remote.remote_id)
            && matches_any(&remote.title, keys)
    })
}

/// An unmapped, incomplete local task created within `window` of `now`.
/// Tasks without a known creation time never match.
pub fn recent_local<'a>(
    locals: impl IntoIterator<Item = &'a LocalTask>,
    mappings: &MappingStore,
    claimed: &HashSet<String>,
    keys: &[String],
    now: DateTime<Utc>,
    window: Duration,
) -> Option<&'a LocalTask> {
    locals.into_iter().find(|local| {
        !local.completed
            && mappings.by_local(&local.local_id).is_none()
            && !claimed.contains(&local.local_id)
            && local
                .created_at
                .is_some_and(|created| now.signed_duration_since(created) <= window)
            && matches_any(&local.title, keys)
    })
}
