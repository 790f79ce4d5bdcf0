//! GitLab API client.
//!
//! Provides an HTTP client for GitLab API v4 with private-token
//! authentication, header-driven pagination and per-call request metrics.

use crate::error::AppError;
use crate::models::MetricsRecorder;
use crate::services::issue_matcher::IssueLinked;
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.example.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Page size for list endpoints.
    pub per_page: u32,
}

impl Default for GitLabClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout_secs: 30,
            per_page: 100,
        }
    }
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
    base: Url,
}

/// Pagination cursor from GitLab response headers.
#[derive(Debug, Clone, Default)]
pub struct PaginationInfo {
    /// Next page number; `None` on the last page.
    pub next_page: Option<u32>,
}

/// GitLab merge request from the project list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabMergeRequest {
    pub iid: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub reviewers: Option<Vec<GitLabUser>>,
    /// Cheap comment-count hint; zero means there is nothing to resolve.
    #[serde(default)]
    pub user_notes_count: Option<i64>,
}

impl GitLabMergeRequest {
    /// Reviewers with a non-blank display name.
    pub fn named_reviewers(&self) -> impl Iterator<Item = &GitLabUser> {
        self.reviewers
            .iter()
            .flatten()
            .filter(|user| !user.name.trim().is_empty())
    }
}

impl IssueLinked for GitLabMergeRequest {
    fn iid(&self) -> i64 {
        self.iid
    }

    fn explicit_issue_ids(&self) -> &[String] {
        &[]
    }

    fn title(&self) -> Option<&str> {
        Some(&self.title)
    }
}

/// GitLab user from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabUser {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// GitLab discussion from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabDiscussion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub notes: Vec<GitLabDiscussionNote>,
}

/// GitLab discussion note; only the fields comment statistics need.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabDiscussionNote {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub resolvable: bool,
    #[serde(default)]
    pub resolved: Option<bool>,
}

/// Response from the MR approvals endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequestApprovals {
    #[serde(default)]
    pub approved_by: Vec<ApprovedBy>,
}

/// User who approved an MR.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovedBy {
    pub user: GitLabUser,
}

/// A downloaded avatar image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// The GitLab endpoints the pipeline consumes.
///
/// Every call records itself into the supplied [`MetricsRecorder`].
#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// All merge requests of a project, most recently updated first.
    async fn list_merge_requests(
        &self,
        project_id: &str,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabMergeRequest>, AppError>;

    /// All project members, including inherited ones.
    async fn list_project_members(
        &self,
        project_id: &str,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabUser>, AppError>;

    async fn get_mr_approvals(
        &self,
        project_id: &str,
        mr_iid: i64,
        metrics: &MetricsRecorder,
    ) -> Result<MergeRequestApprovals, AppError>;

    async fn list_discussions(
        &self,
        project_id: &str,
        mr_iid: i64,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabDiscussion>, AppError>;

    /// Fetch an avatar image, absolute or relative to the base URL.
    async fn download_avatar(
        &self,
        url: &str,
        metrics: &MetricsRecorder,
    ) -> Result<AvatarImage, AppError>;
}

/// Normalize a user-entered GitLab URL to `origin + path`, without trailing
/// slashes and without a bare `/` path.
pub fn normalize_base_url(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_config_field("GitLab base URL is empty", "baseUrl"));
    }

    let parsed = Url::parse(trimmed).map_err(|e| {
        AppError::invalid_config_field(format!("Invalid GitLab base URL: {}", e), "baseUrl")
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(AppError::invalid_config_field(
            "GitLab base URL must be an http(s) URL",
            "baseUrl",
        ));
    }

    let path = parsed.path().trim_end_matches('/');
    Ok(format!("{}{}", parsed.origin().ascii_serialization(), path))
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, AppError> {
        header::HeaderValue::from_str(&config.token)
            .map_err(|_| AppError::invalid_config_field("Invalid token format", "apiKey"))?;

        let normalized = normalize_base_url(&config.base_url)?;
        let base = Url::parse(&normalized)
            .map_err(|e| AppError::invalid_config(format!("Invalid GitLab base URL: {}", e)))?;

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: GitLabClientConfig {
                base_url: normalized,
                ..config
            },
            base,
        })
    }

    /// Get the full URL for an API path.
    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v4{}", self.config.base_url, path)
    }

    fn project_path(project_id: &str) -> String {
        format!("/projects/{}", urlencoding::encode(project_id.trim()))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("PRIVATE-TOKEN", &self.config.token)
    }

    /// Resolve an avatar URL against the base URL.
    pub fn resolve_avatar_url(&self, url: &str) -> Result<Url, AppError> {
        self.base
            .join(url.trim())
            .map_err(|e| AppError::network(format!("Invalid avatar URL {}: {}", url, e)))
    }

    /// The token is only sent to the configured GitLab origin.
    pub fn should_attach_token(&self, url: &Url) -> bool {
        url.origin() == self.base.origin()
    }

    /// Send a built request, recording it first.
    async fn send(
        &self,
        request: RequestBuilder,
        metrics: &MetricsRecorder,
    ) -> Result<Response, AppError> {
        let request = request.build()?;
        metrics.record_api(request.url().as_str());
        Ok(self.client.execute(request).await?)
    }

    /// Parse pagination headers from response.
    fn parse_pagination(response: &Response) -> PaginationInfo {
        let next_page = response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());

        PaginationInfo { next_page }
    }

    /// Handle API response errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, AppError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| {
                    AppError::protocol(format!("Failed to parse response: {}", e), endpoint)
                });
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let body_message = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
            // GitLab returns errors as {"message": "..."} or {"error": "..."}
            v.get("message").or_else(|| v.get("error")).map(|m| match m.as_str() {
                Some(s) => s.to_string(),
                None => m.to_string(),
            })
        });

        let message = match (status, &body_message) {
            (StatusCode::UNAUTHORIZED, _) => "GitLab token expired or revoked".to_string(),
            (StatusCode::FORBIDDEN, _) => "Access denied".to_string(),
            (StatusCode::NOT_FOUND, _) => "Resource not found".to_string(),
            (StatusCode::TOO_MANY_REQUESTS, _) => "Rate limit exceeded".to_string(),
            (_, Some(msg)) => msg.clone(),
            _ => format!("Request failed ({}): {}", status_code, body),
        };

        Err(AppError::gitlab_api_full(message, status_code, endpoint))
    }

    /// Fetch every page of a list endpoint.
    ///
    /// A page whose body is not a JSON array is a protocol error.
    pub async fn get_all_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        metrics: &MetricsRecorder,
    ) -> Result<Vec<T>, AppError> {
        let mut all_data = Vec::new();
        let mut page = 1u32;
        let per_page = self.config.per_page.to_string();

        loop {
            let request = self
                .authorized(self.client.get(self.api_url(endpoint)))
                .query(query)
                .query(&[("page", page.to_string().as_str()), ("per_page", per_page.as_str())]);

            let response = self.send(request, metrics).await?;
            let pagination = Self::parse_pagination(&response);
            let body: Value = self.handle_response(response, endpoint).await?;

            let Value::Array(items) = body else {
                return Err(AppError::protocol(
                    format!("Expected a JSON array on page {}", page),
                    endpoint,
                ));
            };
            for item in items {
                let parsed = serde_json::from_value(item).map_err(|e| {
                    AppError::protocol(format!("Unexpected item shape: {}", e), endpoint)
                })?;
                all_data.push(parsed);
            }

            match pagination.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(all_data)
    }
}

#[async_trait]
impl GitLabApi for GitLabClient {
    async fn list_merge_requests(
        &self,
        project_id: &str,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabMergeRequest>, AppError> {
        let endpoint = format!("{}/merge_requests", Self::project_path(project_id));
        self.get_all_pages(&endpoint, &[("order_by", "updated_at"), ("sort", "desc")], metrics)
            .await
    }

    async fn list_project_members(
        &self,
        project_id: &str,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabUser>, AppError> {
        let endpoint = format!("{}/members/all", Self::project_path(project_id));
        self.get_all_pages(&endpoint, &[], metrics).await
    }

    async fn get_mr_approvals(
        &self,
        project_id: &str,
        mr_iid: i64,
        metrics: &MetricsRecorder,
    ) -> Result<MergeRequestApprovals, AppError> {
        let endpoint = format!(
            "{}/merge_requests/{}/approvals",
            Self::project_path(project_id),
            mr_iid
        );
        let request = self.authorized(self.client.get(self.api_url(&endpoint)));
        let response = self.send(request, metrics).await?;
        self.handle_response(response, &endpoint).await
    }

    async fn list_discussions(
        &self,
        project_id: &str,
        mr_iid: i64,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabDiscussion>, AppError> {
        let endpoint = format!(
            "{}/merge_requests/{}/discussions",
            Self::project_path(project_id),
            mr_iid
        );
        self.get_all_pages(&endpoint, &[], metrics).await
    }

    async fn download_avatar(
        &self,
        url: &str,
        metrics: &MetricsRecorder,
    ) -> Result<AvatarImage, AppError> {
        let full_url = self.resolve_avatar_url(url)?;
        let attach_token = self.should_attach_token(&full_url);

        let mut request = self.client.get(full_url.clone());
        if attach_token {
            request = self.authorized(request);
        }

        metrics.record_avatar(full_url.as_str());
        let response = request
            .send()
            .await
            .map_err(|e| AppError::network(format!("Avatar download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AppError::gitlab_api_full(
                format!("Avatar download returned status {}", response.status()),
                response.status().as_u16(),
                full_url.as_str(),
            ));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
            .filter(|ct| !ct.is_empty())
            .unwrap_or_else(|| "image/png".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::network(format!("Failed to read avatar data: {}", e)))?;

        Ok(AvatarImage {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
