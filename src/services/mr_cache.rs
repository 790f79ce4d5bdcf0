//! Persisted merge-request cache.
//!
//! One entry per board scope, stored as `{ fetchedAt, mergeRequests }`.
//! Reads re-sanitize against the requested issue set and heal the stored
//! entry when it no longer matches; storage errors are logged and read as a
//! miss so the cache never fails a fetch.

use crate::db::KeyValueStore;
use crate::error::AppError;
use crate::models::MergeRequest;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Storage key prefix for merge-request cache entries.
pub const MR_CACHE_PREFIX: &str = "cache.gitlabMergeRequests.v1.";

/// Partition of the merge-request cache: one GitLab project seen through one
/// saved board view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheScope {
    pub host: String,
    pub project_id: String,
    pub board_scope_key: String,
}

impl CacheScope {
    pub fn new(
        host: impl Into<String>,
        project_id: impl Into<String>,
        board_scope_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            project_id: project_id.into(),
            board_scope_key: board_scope_key.into(),
        }
    }

    /// `host|projectId|boardScopeKey`
    pub fn scope_key(&self) -> String {
        format!("{}|{}|{}", self.host, self.project_id, self.board_scope_key)
    }

    pub fn storage_key(&self) -> String {
        format!("{}{}", MR_CACHE_PREFIX, self.scope_key())
    }
}

/// Merge-request cache over a [`KeyValueStore`].
#[derive(Clone)]
pub struct MergeRequestCache {
    store: Arc<dyn KeyValueStore>,
}

impl MergeRequestCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cached MRs for `scope` relevant to `issue_ids`.
    ///
    /// Never fails: a missing, malformed or unreadable entry is an empty
    /// list. When sanitizing changed the stored list, the corrected list is
    /// written back, or the entry is deleted if nothing survived.
    pub async fn get(&self, scope: &CacheScope, issue_ids: &BTreeSet<String>) -> Vec<MergeRequest> {
        let key = scope.storage_key();
        let stored = match self.store.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("[mr_cache] Failed to read {}: {}", key, e);
                return Vec::new();
            }
        };

        let stored_list = stored.get("mergeRequests").and_then(Value::as_array);
        let sanitized = sanitize_list(stored_list.into_iter().flatten(), issue_ids);

        if sanitized.is_empty() {
            self.delete_quietly(&key).await;
            return sanitized;
        }

        let healed = match serde_json::to_value(&sanitized) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[mr_cache] Failed to serialize healed entry for {}: {}", key, e);
                return sanitized;
            }
        };
        if stored_list != healed.as_array() {
            let fetched_at = stored
                .get("fetchedAt")
                .and_then(Value::as_i64)
                .unwrap_or_else(now_ms);
            log::debug!("[mr_cache] Healing {} ({} MRs kept)", key, sanitized.len());
            if let Err(e) = self.store.set(&key, envelope(fetched_at, healed)).await {
                log::warn!("[mr_cache] Failed to heal {}: {}", key, e);
            }
        } else {
            log::debug!("[mr_cache] Hit {} ({} MRs)", key, sanitized.len());
        }

        sanitized
    }

    /// Store a fresh fetch result for `scope`.
    ///
    /// Writes only when the sanitized list differs from what is stored; an
    /// empty result deletes the entry.
    pub async fn set(
        &self,
        scope: &CacheScope,
        merge_requests: &[MergeRequest],
        issue_ids: &BTreeSet<String>,
    ) -> Result<(), AppError> {
        let key = scope.storage_key();
        let sanitized: Vec<MergeRequest> = merge_requests
            .iter()
            .cloned()
            .filter_map(|mr| mr.sanitized(issue_ids))
            .collect();

        if sanitized.is_empty() {
            return self.store.delete(&key).await;
        }

        let next = serde_json::to_value(&sanitized)?;
        let current = self.store.get(&key).await.unwrap_or_else(|e| {
            log::warn!("[mr_cache] Failed to read {} before write: {}", key, e);
            None
        });
        if current.as_ref().and_then(|v| v.get("mergeRequests")) == Some(&next) {
            log::debug!("[mr_cache] {} unchanged, skipping write", key);
            return Ok(());
        }

        self.store.set(&key, envelope(now_ms(), next)).await
    }

    async fn delete_quietly(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            log::warn!("[mr_cache] Failed to delete {}: {}", key, e);
        }
    }
}

fn sanitize_list<'a>(
    values: impl Iterator<Item = &'a Value>,
    issue_ids: &BTreeSet<String>,
) -> Vec<MergeRequest> {
    values
        .filter_map(MergeRequest::from_cache_value)
        .filter_map(|mr| mr.sanitized(issue_ids))
        .collect()
}

fn envelope(fetched_at: i64, merge_requests: Value) -> Value {
    json!({
        "fetchedAt": fetched_at,
        "mergeRequests": merge_requests,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryKvStore;
    use crate::models::{MergeRequestState, Reviewer};

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn mr(iid: i64, issue_ids: &[&str]) -> MergeRequest {
        MergeRequest {
            iid,
            issue_ids: issue_ids.iter().map(|s| s.to_string()).collect(),
            state: MergeRequestState::Open,
            url: format!("https://git.example.com/g/p/-/merge_requests/{}", iid),
            reviewers: vec![Reviewer { name: "Ann Lee".into(), url: None }],
            approved: true,
            total_comments: 2,
            unresolved_comments: 1,
        }
    }

    fn scope() -> CacheScope {
        CacheScope::new("git.example.com", "7", "https://tracker.example.com/board")
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(
            scope().storage_key(),
            "cache.gitlabMergeRequests.v1.git.example.com|7|https://tracker.example.com/board"
        );
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = Arc::new(MemoryKvStore::new());
        let cache = MergeRequestCache::new(store.clone());
        let requested = ids(&["11111", "22222"]);
        let list = vec![mr(2, &["11111"]), mr(1, &["22222", "33333"])];

        cache.set(&scope(), &list, &requested).await.unwrap();
        assert_eq!(cache.get(&scope(), &requested).await, list);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_set_skips_write() {
        let store = Arc::new(MemoryKvStore::new());
        let cache = MergeRequestCache::new(store.clone());
        let requested = ids(&["11111"]);

        cache.set(&scope(), &[mr(1, &["11111"])], &requested).await.unwrap();
        cache.set(&scope(), &[mr(1, &["11111"])], &requested).await.unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_deletes_entry() {
        let store = Arc::new(MemoryKvStore::new());
        let cache = MergeRequestCache::new(store.clone());
        let key = scope().storage_key();

        cache.set(&scope(), &[mr(1, &["11111"])], &ids(&["11111"])).await.unwrap();
        assert!(store.contains(&key).await);

        cache.set(&scope(), &[mr(1, &["11111"])], &ids(&["99999"])).await.unwrap();
        assert!(!store.contains(&key).await);
    }

    #[tokio::test]
    async fn test_get_heals_narrowed_request() {
        let store = Arc::new(MemoryKvStore::new());
        let cache = MergeRequestCache::new(store.clone());

        cache
            .set(&scope(), &[mr(2, &["11111"]), mr(1, &["22222"])], &ids(&["11111", "22222"]))
            .await
            .unwrap();

        let narrowed = ids(&["11111"]);
        assert_eq!(cache.get(&scope(), &narrowed).await, vec![mr(2, &["11111"])]);

        let stored = store.get(&scope().storage_key()).await.unwrap().unwrap();
        assert_eq!(stored["mergeRequests"].as_array().unwrap().len(), 1);
        assert_eq!(cache.get(&scope(), &ids(&["22222"])).await, Vec::new());
        assert!(!store.contains(&scope().storage_key()).await);
    }

    #[tokio::test]
    async fn test_get_repairs_malformed_entry() {
        let store = Arc::new(MemoryKvStore::new());
        let key = scope().storage_key();
        store
            .set(
                &key,
                json!({
                    "fetchedAt": 5,
                    "mergeRequests": [
                        {"iid": "3", "title": "11111 - From raw API", "state": "opened",
                         "totalComments": 1, "unresolvedComments": 4},
                        {"title": "no iid"},
                        "garbage"
                    ]
                }),
            )
            .await
            .unwrap();

        let cache = MergeRequestCache::new(store.clone());
        let result = cache.get(&scope(), &ids(&["11111"])).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].iid, 3);
        assert_eq!(result[0].unresolved_comments, 1);

        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored["fetchedAt"], 5);
        assert_eq!(stored["mergeRequests"][0]["issueIds"], json!(["11111"]));

        store.set(&key, json!("not an object")).await.unwrap();
        assert!(cache.get(&scope(), &ids(&["11111"])).await.is_empty());
        assert!(!store.contains(&key).await);
    }
}
