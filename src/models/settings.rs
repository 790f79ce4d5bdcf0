//! Extension settings as written by the popup.

use serde::{Deserialize, Serialize};

/// Storage key of the merge-request feature toggle.
pub const GITLAB_MR_FEATURE_KEY: &str = "feature.gitlabMrStatus.enabled";

/// Storage key of the GitLab base URL.
pub const GITLAB_BASE_URL_KEY: &str = "settings.gitlabBaseUrl";

/// Storage key of the GitLab private token.
pub const GITLAB_API_KEY_KEY: &str = "settings.gitlabApiKey";

/// Storage key of the `trackerProject=gitlabProjectId` mapping text.
pub const GITLAB_PROJECT_MAP_KEY: &str = "settings.gitlabProjectMap";

/// Raw user settings; missing keys read as disabled/empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSettings {
    pub mr_feature_enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub project_map: String,
}

/// A fully resolved GitLab target for one tracker project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectTarget {
    /// Normalized base URL (origin plus optional path, no trailing slash).
    pub base_url: String,

    /// Host (with port when explicit), used to partition cache keys.
    pub host: String,

    /// Private token sent as `PRIVATE-TOKEN`.
    pub api_key: String,

    /// GitLab project ID or URL-encodable path.
    pub project_id: String,
}

/// Fetch and cache policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent approval/discussion lookups per fetch.
    pub enrichment_concurrency: usize,

    /// Page size for paginated list endpoints (GitLab max is 100).
    pub per_page: u32,

    /// Lifetime of avatar name and image cache entries.
    pub avatar_ttl_secs: i64,

    /// Timeout applied to each outbound HTTP request.
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enrichment_concurrency: 6,
            per_page: 100,
            avatar_ttl_secs: 24 * 60 * 60,
            request_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn avatar_ttl_ms(&self) -> i64 {
        self.avatar_ttl_secs * 1000
    }
}
