//! Extension settings loader.
//!
//! Reads the popup-owned keys from the key-value store and resolves a
//! tracker project to a complete GitLab target.

use crate::db::KeyValueStore;
use crate::error::AppError;
use crate::models::settings::{
    GITLAB_API_KEY_KEY, GITLAB_BASE_URL_KEY, GITLAB_MR_FEATURE_KEY, GITLAB_PROJECT_MAP_KEY,
};
use crate::models::{ExtensionSettings, ProjectTarget};
use crate::services::gitlab_client::normalize_base_url;
use reqwest::Url;
use serde_json::Value;

/// Result of parsing the `trackerProject=gitlabProjectId` mapping text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectMap {
    /// Valid mappings in file order; the first one for a project wins.
    pub entries: Vec<(String, String)>,

    /// Non-comment lines that could not be parsed.
    pub invalid_line_count: usize,
}

impl ProjectMap {
    pub fn lookup(&self, tracker_project: &str) -> Option<&str> {
        let wanted = tracker_project.trim();
        self.entries
            .iter()
            .find(|(project, _)| project == wanted)
            .map(|(_, gitlab_id)| gitlab_id.as_str())
    }
}

/// Parse the mapping text.
///
/// Blank lines and `#` comments are skipped. A line needs an `=` after at
/// least one character and a non-empty value on both sides.
pub fn parse_project_map(raw: &str) -> ProjectMap {
    let mut map = ProjectMap::default();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((project, gitlab_id)) = trimmed.split_once('=') else {
            map.invalid_line_count += 1;
            continue;
        };
        let (project, gitlab_id) = (project.trim(), gitlab_id.trim());
        if project.is_empty() || gitlab_id.is_empty() {
            map.invalid_line_count += 1;
            continue;
        }

        map.entries.push((project.to_string(), gitlab_id.to_string()));
    }

    map
}

/// Host of a normalized base URL, with the port when it is not the default.
pub fn base_url_host(base_url: &str) -> Result<String, AppError> {
    let url = Url::parse(base_url).map_err(|e| {
        AppError::invalid_config_field(format!("Invalid GitLab base URL: {}", e), "baseUrl")
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::invalid_config_field("GitLab base URL has no host", "baseUrl"))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

impl ExtensionSettings {
    /// Load settings; missing or mistyped keys read as disabled/empty.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self, AppError> {
        let enabled = store.get(GITLAB_MR_FEATURE_KEY).await?;
        let base_url = store.get(GITLAB_BASE_URL_KEY).await?;
        let api_key = store.get(GITLAB_API_KEY_KEY).await?;
        let project_map = store.get(GITLAB_PROJECT_MAP_KEY).await?;

        Ok(Self {
            mr_feature_enabled: enabled.as_ref().and_then(Value::as_bool).unwrap_or(false),
            base_url: string_setting(base_url),
            api_key: string_setting(api_key),
            project_map: string_setting(project_map),
        })
    }

    /// Resolve a tracker project to a GitLab target.
    ///
    /// Returns `Ok(None)` when the feature is off or the project is not
    /// mapped, and `InvalidConfig` when the URL or token is unusable.
    pub fn resolve_project(
        &self,
        tracker_project: &str,
    ) -> Result<Option<ProjectTarget>, AppError> {
        if !self.mr_feature_enabled {
            return Ok(None);
        }

        let project_map = parse_project_map(&self.project_map);
        if project_map.invalid_line_count > 0 {
            log::debug!(
                "[settings] Ignoring {} malformed project map line(s)",
                project_map.invalid_line_count
            );
        }
        let Some(project_id) = project_map.lookup(tracker_project).map(str::to_string) else {
            return Ok(None);
        };

        let api_key = self.api_key.trim();
        if api_key.is_empty() {
            return Err(AppError::invalid_config_field("GitLab API key is empty", "apiKey"));
        }

        let base_url = normalize_base_url(&self.base_url)?;
        let host = base_url_host(&base_url)?;

        Ok(Some(ProjectTarget {
            base_url,
            host,
            api_key: api_key.to_string(),
            project_id,
        }))
    }
}

fn string_setting(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}
