//! Assignee avatar resolution and caching.
//!
//! Tracker assignee names are matched against GitLab project members by
//! normalized display name. Matched avatars are downloaded once, stored as
//! base64 data URIs and shared through a per-host image cache. Both caches
//! expire after the configured TTL and are pruned lazily on read.

use crate::db::KeyValueStore;
use crate::error::AppError;
use crate::models::avatar::prune_expired_cache_entries;
use crate::models::{ImageCacheEntry, MetricsRecorder, NameCacheEntry, ProjectTarget};
use crate::services::gitlab_client::{AvatarImage, GitLabApi, GitLabUser};
use crate::services::issue_matcher::normalize_person_name;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Storage key prefix of the name-resolution cache (`<host>|<projectId>`).
pub const AVATAR_NAME_CACHE_PREFIX: &str = "cache.gitlabAssigneeAvatars.v1.";

/// Storage key prefix of the shared image cache (`<host>`).
pub const AVATAR_IMAGE_CACHE_PREFIX: &str = "cache.gitlabAvatarImages.v1.";

pub fn name_cache_key(target: &ProjectTarget) -> String {
    format!("{}{}|{}", AVATAR_NAME_CACHE_PREFIX, target.host, target.project_id)
}

pub fn image_cache_key(target: &ProjectTarget) -> String {
    format!("{}{}", AVATAR_IMAGE_CACHE_PREFIX, target.host)
}

/// Encode image bytes as a data URI.
pub fn to_data_url(image: &AvatarImage) -> String {
    format!("data:{};base64,{}", image.content_type, STANDARD.encode(&image.bytes))
}

/// A JSON-object cache loaded from the store, written back at most once.
struct CacheMap {
    key: String,
    entries: Map<String, Value>,
    dirty: bool,
}

impl CacheMap {
    async fn load(store: &dyn KeyValueStore, key: String, ttl_ms: i64, now_ms: i64) -> Self {
        let mut dirty = false;
        let mut entries = match store.get(&key).await {
            Ok(Some(Value::Object(map))) => map,
            Ok(Some(_)) => {
                dirty = true;
                Map::new()
            }
            Ok(None) => Map::new(),
            Err(e) => {
                log::warn!("[avatar] Failed to read {}: {}", key, e);
                Map::new()
            }
        };

        dirty |= prune_expired_cache_entries(&mut entries, ttl_ms, now_ms);
        Self { key, entries, dirty }
    }

    fn insert(&mut self, key: String, value: Value) {
        self.entries.insert(key, value);
        self.dirty = true;
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
    }

    async fn flush(self, store: &dyn KeyValueStore) {
        if !self.dirty {
            return;
        }
        let result = if self.entries.is_empty() {
            store.delete(&self.key).await
        } else {
            store.set(&self.key, Value::Object(self.entries)).await
        };
        if let Err(e) = result {
            log::warn!("[avatar] Failed to write {}: {}", self.key, e);
        }
    }
}

/// Avatar resolver bound to a key-value store.
#[derive(Clone)]
pub struct AvatarService {
    store: Arc<dyn KeyValueStore>,
    ttl_ms: i64,
}

impl AvatarService {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl_ms: i64) -> Self {
        Self { store, ttl_ms }
    }

    /// Resolve assignee names to avatar data URIs.
    ///
    /// The result is keyed by the names exactly as requested. Names cached
    /// as unmatched are not looked up again until they expire. With
    /// `cache_only` no network call is made. Failure to list project members
    /// is returned as an error; a failed image download only leaves that
    /// name unresolved.
    pub async fn resolve_assignee_avatars(
        &self,
        api: &dyn GitLabApi,
        target: &ProjectTarget,
        names: &[String],
        cache_only: bool,
        metrics: &MetricsRecorder,
    ) -> Result<BTreeMap<String, String>, AppError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let store = self.store.as_ref();

        // normalized name -> requested spellings
        let mut requested: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in names {
            let trimmed = name.trim();
            let normalized = normalize_person_name(trimmed);
            if normalized.is_empty() {
                continue;
            }
            let spellings = requested.entry(normalized).or_default();
            if !spellings.iter().any(|s| s == trimmed) {
                spellings.push(trimmed.to_string());
            }
        }

        let mut result = BTreeMap::new();
        if requested.is_empty() {
            return Ok(result);
        }

        let mut name_cache =
            CacheMap::load(store, name_cache_key(target), self.ttl_ms, now_ms).await;
        let mut pending = Vec::new();

        for (normalized, spellings) in &requested {
            let cached = name_cache
                .entries
                .get(normalized)
                .cloned()
                .map(serde_json::from_value::<NameCacheEntry>);
            match cached {
                Some(Ok(entry)) if !entry.matched || entry.usable_data_url().is_some() => {
                    if let Some(data_url) = entry.usable_data_url() {
                        for spelling in spellings {
                            result.insert(spelling.clone(), data_url.to_string());
                        }
                    }
                }
                Some(_) => {
                    name_cache.remove(normalized);
                    pending.push(normalized.clone());
                }
                None => pending.push(normalized.clone()),
            }
        }

        log::debug!(
            "[avatar] {} names from cache, {} pending (cache_only={})",
            requested.len() - pending.len(),
            pending.len(),
            cache_only
        );

        if cache_only || pending.is_empty() {
            name_cache.flush(store).await;
            return Ok(result);
        }

        let members = match api.list_project_members(&target.project_id, metrics).await {
            Ok(members) => members,
            Err(e) => {
                name_cache.flush(store).await;
                return Err(e);
            }
        };
        let members_by_name = index_members(&members);
        let mut image_cache =
            CacheMap::load(store, image_cache_key(target), self.ttl_ms, now_ms).await;

        for normalized in pending {
            let avatar_url = match members_by_name.get(normalized.as_str()).map(Vec::as_slice) {
                Some([member]) => member
                    .avatar_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty()),
                _ => None,
            };

            let Some(avatar_url) = avatar_url else {
                let entry = NameCacheEntry::unmatched(now_ms);
                name_cache.insert(normalized, serde_json::to_value(entry)?);
                continue;
            };

            let Some(data_url) = self
                .image_data_url(api, &mut image_cache, avatar_url, now_ms, metrics)
                .await
            else {
                continue;
            };

            if let Some(spellings) = requested.get(&normalized) {
                for spelling in spellings {
                    result.insert(spelling.clone(), data_url.clone());
                }
            }
            let entry = NameCacheEntry::matched(data_url, avatar_url.to_string(), now_ms);
            name_cache.insert(normalized, serde_json::to_value(entry)?);
        }

        name_cache.flush(store).await;
        image_cache.flush(store).await;

        Ok(result)
    }

    async fn image_data_url(
        &self,
        api: &dyn GitLabApi,
        image_cache: &mut CacheMap,
        avatar_url: &str,
        now_ms: i64,
        metrics: &MetricsRecorder,
    ) -> Option<String> {
        let cached = image_cache
            .entries
            .get(avatar_url)
            .cloned()
            .and_then(|value| serde_json::from_value::<ImageCacheEntry>(value).ok())
            .filter(|entry| !entry.data_url.is_empty());
        if let Some(entry) = cached {
            return Some(entry.data_url);
        }

        match api.download_avatar(avatar_url, metrics).await {
            Ok(image) => {
                let entry = ImageCacheEntry {
                    data_url: to_data_url(&image),
                    fetched_at: now_ms,
                };
                let data_url = entry.data_url.clone();
                match serde_json::to_value(entry) {
                    Ok(value) => image_cache.insert(avatar_url.to_string(), value),
                    Err(e) => log::warn!("[avatar] Failed to encode cache entry: {}", e),
                }
                Some(data_url)
            }
            Err(e) => {
                log::warn!("[avatar] Download failed for {}: {}", avatar_url, e);
                None
            }
        }
    }
}

/// Members grouped by normalized display name; more than one member under a
/// name makes it ambiguous.
fn index_members(members: &[GitLabUser]) -> HashMap<String, Vec<&GitLabUser>> {
    let mut index: HashMap<String, Vec<&GitLabUser>> = HashMap::new();
    for member in members {
        let normalized = normalize_person_name(&member.name);
        if normalized.is_empty() {
            continue;
        }
        let bucket = index.entry(normalized).or_default();
        if !bucket.iter().any(|m| m.id != 0 && m.id == member.id) {
            bucket.push(member);
        }
    }
    index
}
