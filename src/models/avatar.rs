//! Assignee avatar cache entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of resolving one normalized assignee name against project members.
///
/// `matched == false` records a miss or an ambiguous name so it is not looked
/// up again until the entry expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameCacheEntry {
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_source_url: Option<String>,
    /// Unix milliseconds.
    pub fetched_at: i64,
}

impl NameCacheEntry {
    pub fn matched(data_url: String, avatar_source_url: String, fetched_at: i64) -> Self {
        Self {
            matched: true,
            data_url: Some(data_url),
            avatar_source_url: Some(avatar_source_url),
            fetched_at,
        }
    }

    pub fn unmatched(fetched_at: i64) -> Self {
        Self {
            matched: false,
            data_url: None,
            avatar_source_url: None,
            fetched_at,
        }
    }

    /// Data URI to render, only for matched entries.
    pub fn usable_data_url(&self) -> Option<&str> {
        if !self.matched {
            return None;
        }
        self.data_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// A downloaded avatar image, shared by every name that points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCacheEntry {
    pub data_url: String,
    /// Unix milliseconds.
    pub fetched_at: i64,
}

/// Remove entries whose `fetchedAt` is missing, in the future or older
/// than `ttl_ms`.
///
/// Returns whether anything was removed, so callers know a write-back is due.
pub fn prune_expired_cache_entries(
    cache: &mut Map<String, Value>,
    ttl_ms: i64,
    now_ms: i64,
) -> bool {
    let before = cache.len();
    cache.retain(|_, entry| {
        entry
            .get("fetchedAt")
            .and_then(Value::as_i64)
            .is_some_and(|fetched_at| {
                fetched_at <= now_ms && now_ms.saturating_sub(fetched_at) <= ttl_ms
            })
    });
    cache.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    #[test]
    fn test_prune_removes_expired_and_undated() {
        let now = 100 * HOUR_MS;
        let mut cache = json!({
            "fresh": {"matched": false, "fetchedAt": now - HOUR_MS},
            "stale": {"matched": false, "fetchedAt": now - 25 * HOUR_MS},
            "undated": {"matched": false}
        })
        .as_object()
        .cloned()
        .unwrap();

        assert!(prune_expired_cache_entries(&mut cache, 24 * HOUR_MS, now));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["fresh"]);
        assert!(!prune_expired_cache_entries(&mut cache, 24 * HOUR_MS, now));
    }

    #[test]
    fn test_prune_drops_out_of_range_timestamps() {
        let now = 100 * HOUR_MS;
        let mut cache = json!({
            "ancient": {"matched": false, "fetchedAt": i64::MIN},
            "future": {"matched": false, "fetchedAt": now + HOUR_MS},
            "fresh": {"matched": false, "fetchedAt": now}
        })
        .as_object()
        .cloned()
        .unwrap();

        assert!(prune_expired_cache_entries(&mut cache, 24 * HOUR_MS, now));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["fresh"]);
    }

    #[test]
    fn test_unmatched_entry_has_no_data_url() {
        assert_eq!(NameCacheEntry::unmatched(1).usable_data_url(), None);
        let entry = NameCacheEntry::matched("data:image/png;base64,AA==".into(), "u".into(), 1);
        assert_eq!(entry.usable_data_url(), Some("data:image/png;base64,AA=="));
    }
}
