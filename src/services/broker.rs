//! Request broker between the page context and the background context.
//!
//! Page code talks to the broker only through [`BrokerHandle`], which sends a
//! [`BrokerRequest`] over an mpsc channel and awaits a oneshot reply. The
//! broker is the error boundary: every request resolves to a
//! [`BrokerResponse`], failures included.

use crate::db::KeyValueStore;
use crate::error::AppError;
use crate::models::{
    ExtensionSettings, MergeRequest, MetricsRecorder, PipelineConfig, ProjectTarget, RequestMetrics,
};
use crate::services::avatar::AvatarService;
use crate::services::gitlab_client::{GitLabApi, GitLabClient, GitLabClientConfig};
use crate::services::issue_matcher::normalize_issue_id_list;
use crate::services::merge_requests::fetch_merge_requests_for_issues;
use crate::services::mr_cache::{CacheScope, MergeRequestCache};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Messages the page context can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerRequest {
    #[serde(rename_all = "camelCase")]
    IsProjectReady { project_name: String },

    #[serde(rename_all = "camelCase")]
    FetchMergeRequests {
        project_name: String,
        issue_ids: Vec<String>,
        #[serde(default)]
        cache_only: bool,
        #[serde(default)]
        board_scope_key: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    FetchAssigneeAvatars {
        project_name: String,
        assignee_names: Vec<String>,
        #[serde(default)]
        cache_only: bool,
    },

    Ping,

    #[serde(rename_all = "camelCase")]
    RegisterTrackerTab { tab_id: i64, is_tracker: bool },

    #[serde(rename_all = "camelCase")]
    IsTrackerTab { tab_id: i64 },

    /// The host closed a tab; its tracker flag is dropped.
    #[serde(rename_all = "camelCase")]
    TabClosed { tab_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestsReply {
    pub merge_requests: Vec<MergeRequest>,
    pub request_metrics: RequestMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarsReply {
    pub avatars_by_name: BTreeMap<String, String>,
    pub request_metrics: RequestMetrics,
}

/// Payload of a broker reply, flattened next to `ok`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    #[serde(rename_all = "camelCase")]
    ProjectReady { is_ready: bool },
    MergeRequests(MergeRequestsReply),
    AssigneeAvatars(AvatarsReply),
    Pong { source: String },
    #[serde(rename_all = "camelCase")]
    TrackerTab { is_tracker_tab: bool },
    Ack {},
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

/// `{ ok, ...body }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl BrokerResponse {
    pub fn success(body: ResponseBody) -> Self {
        Self { ok: true, body }
    }

    pub fn failed(error: &AppError) -> Self {
        Self {
            ok: false,
            body: ResponseBody::Failed {
                error: error.to_string(),
                status: error.status_code(),
            },
        }
    }
}

/// A request that did not produce data, as seen by the page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct BrokerFailure {
    pub error: String,
    pub status: Option<u16>,
}

impl From<AppError> for BrokerFailure {
    fn from(err: AppError) -> Self {
        Self {
            status: err.status_code(),
            error: err.to_string(),
        }
    }
}

impl BrokerResponse {
    fn into_result(self) -> Result<ResponseBody, BrokerFailure> {
        match self.body {
            ResponseBody::Failed { error, status } => Err(BrokerFailure { error, status }),
            body if self.ok => Ok(body),
            _ => Err(BrokerFailure {
                error: "Request failed".to_string(),
                status: None,
            }),
        }
    }
}

/// Background-context state that outlives individual requests.
#[derive(Debug, Default)]
pub struct BackgroundState {
    tracker_tabs: RwLock<HashMap<i64, bool>>,
}

impl BackgroundState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_tab(&self, tab_id: i64, is_tracker: bool) {
        self.tracker_tabs.write().await.insert(tab_id, is_tracker);
    }

    pub async fn is_tracker_tab(&self, tab_id: i64) -> bool {
        self.tracker_tabs.read().await.get(&tab_id).copied().unwrap_or(false)
    }

    pub async fn forget_tab(&self, tab_id: i64) {
        self.tracker_tabs.write().await.remove(&tab_id);
    }
}

/// Builds a GitLab API for a resolved project target.
pub trait GitLabApiFactory: Send + Sync {
    fn create(
        &self,
        target: &ProjectTarget,
        config: &PipelineConfig,
    ) -> Result<Arc<dyn GitLabApi>, AppError>;
}

/// Factory for the real HTTP client.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpGitLabApiFactory;

impl GitLabApiFactory for HttpGitLabApiFactory {
    fn create(
        &self,
        target: &ProjectTarget,
        config: &PipelineConfig,
    ) -> Result<Arc<dyn GitLabApi>, AppError> {
        let client = GitLabClient::new(GitLabClientConfig {
            base_url: target.base_url.clone(),
            token: target.api_key.clone(),
            timeout_secs: config.request_timeout_secs,
            per_page: config.per_page,
        })?;
        Ok(Arc::new(client))
    }
}

/// Dispatches broker requests to the pipelines.
pub struct RequestBroker {
    store: Arc<dyn KeyValueStore>,
    state: Arc<BackgroundState>,
    api_factory: Arc<dyn GitLabApiFactory>,
    config: PipelineConfig,
    mr_cache: MergeRequestCache,
    avatars: AvatarService,
}

impl RequestBroker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        state: Arc<BackgroundState>,
        api_factory: Arc<dyn GitLabApiFactory>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            mr_cache: MergeRequestCache::new(store.clone()),
            avatars: AvatarService::new(store.clone(), config.avatar_ttl_ms()),
            store,
            state,
            api_factory,
            config,
        }
    }

    /// Serve one request. Never fails; errors become `ok: false` replies.
    pub async fn handle(&self, request: BrokerRequest) -> BrokerResponse {
        let result = match request {
            BrokerRequest::IsProjectReady { project_name } => {
                self.is_project_ready(&project_name).await
            }
            BrokerRequest::FetchMergeRequests {
                project_name,
                issue_ids,
                cache_only,
                board_scope_key,
            } => {
                self.fetch_merge_requests(
                    &project_name,
                    &issue_ids,
                    cache_only,
                    board_scope_key.as_deref(),
                )
                .await
            }
            BrokerRequest::FetchAssigneeAvatars {
                project_name,
                assignee_names,
                cache_only,
            } => {
                self.fetch_assignee_avatars(&project_name, &assignee_names, cache_only)
                    .await
            }
            BrokerRequest::Ping => Ok(ResponseBody::Pong {
                source: "background".to_string(),
            }),
            BrokerRequest::RegisterTrackerTab { tab_id, is_tracker } => {
                self.state.register_tab(tab_id, is_tracker).await;
                Ok(ResponseBody::Ack {})
            }
            BrokerRequest::IsTrackerTab { tab_id } => Ok(ResponseBody::TrackerTab {
                is_tracker_tab: self.state.is_tracker_tab(tab_id).await,
            }),
            BrokerRequest::TabClosed { tab_id } => {
                self.state.forget_tab(tab_id).await;
                Ok(ResponseBody::Ack {})
            }
        };

        match result {
            Ok(body) => BrokerResponse::success(body),
            Err(e) => {
                log::warn!("[broker] Request failed: {}", e);
                BrokerResponse::failed(&e)
            }
        }
    }

    /// Resolve a tracker project, treating bad configuration as "not set up".
    async fn resolve_target(&self, project_name: &str) -> Result<Option<ProjectTarget>, AppError> {
        let settings = ExtensionSettings::load(self.store.as_ref()).await?;
        match settings.resolve_project(project_name) {
            Err(e) if e.is_invalid_config() => {
                log::debug!("[broker] GitLab not configured for {}: {}", project_name, e);
                Ok(None)
            }
            other => other,
        }
    }

    fn api_for(&self, target: &ProjectTarget) -> Result<Option<Arc<dyn GitLabApi>>, AppError> {
        match self.api_factory.create(target, &self.config) {
            Ok(api) => Ok(Some(api)),
            Err(e) if e.is_invalid_config() => {
                log::debug!("[broker] Cannot build GitLab client for {}: {}", target.host, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_project_ready(&self, project_name: &str) -> Result<ResponseBody, AppError> {
        let is_ready = self.resolve_target(project_name).await?.is_some();
        Ok(ResponseBody::ProjectReady { is_ready })
    }

    async fn fetch_merge_requests(
        &self,
        project_name: &str,
        issue_ids: &[String],
        cache_only: bool,
        board_scope_key: Option<&str>,
    ) -> Result<ResponseBody, AppError> {
        let metrics = MetricsRecorder::new();
        let reply = |merge_requests: Vec<MergeRequest>| {
            ResponseBody::MergeRequests(MergeRequestsReply {
                merge_requests,
                request_metrics: metrics.snapshot(),
            })
        };

        let requested: BTreeSet<String> = normalize_issue_id_list(issue_ids).into_iter().collect();
        if requested.is_empty() {
            return Ok(reply(Vec::new()));
        }
        let Some(target) = self.resolve_target(project_name).await? else {
            return Ok(reply(Vec::new()));
        };

        let board_scope_key = board_scope_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .unwrap_or(project_name.trim());
        let scope = CacheScope::new(&target.host, &target.project_id, board_scope_key);

        if cache_only {
            return Ok(reply(self.mr_cache.get(&scope, &requested).await));
        }

        let Some(api) = self.api_for(&target)? else {
            return Ok(reply(Vec::new()));
        };
        let merge_requests = fetch_merge_requests_for_issues(
            api.as_ref(),
            &target.project_id,
            &requested,
            &self.config,
            &metrics,
        )
        .await?;

        if let Err(e) = self.mr_cache.set(&scope, &merge_requests, &requested).await {
            log::warn!("[broker] Failed to cache merge requests for {}: {}", scope.scope_key(), e);
        }

        Ok(reply(merge_requests))
    }

    async fn fetch_assignee_avatars(
        &self,
        project_name: &str,
        assignee_names: &[String],
        cache_only: bool,
    ) -> Result<ResponseBody, AppError> {
        let metrics = MetricsRecorder::new();
        let reply = |avatars_by_name: BTreeMap<String, String>| {
            ResponseBody::AssigneeAvatars(AvatarsReply {
                avatars_by_name,
                request_metrics: metrics.snapshot(),
            })
        };

        let Some(target) = self.resolve_target(project_name).await? else {
            return Ok(reply(BTreeMap::new()));
        };
        let Some(api) = self.api_for(&target)? else {
            return Ok(reply(BTreeMap::new()));
        };

        let avatars = self
            .avatars
            .resolve_assignee_avatars(api.as_ref(), &target, assignee_names, cache_only, &metrics)
            .await?;
        Ok(reply(avatars))
    }

    /// Spawn the broker loop and return a handle for sending requests.
    ///
    /// Each request runs in its own task, so a slow network fetch does not
    /// hold up cache-only requests behind it.
    pub fn start_background(self) -> BrokerHandle {
        let (tx, mut rx) = mpsc::channel::<BrokerEnvelope>(32);
        let broker = Arc::new(self);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let broker = broker.clone();
                tokio::spawn(async move {
                    let response = broker.handle(envelope.request).await;
                    if envelope.reply.send(response).is_err() {
                        log::debug!("[broker] Requester went away before the reply");
                    }
                });
            }
            log::debug!("[broker] Channel closed, broker stopped");
        });

        BrokerHandle { request_tx: tx }
    }
}

/// A request plus the channel its reply goes back on.
#[derive(Debug)]
pub struct BrokerEnvelope {
    pub request: BrokerRequest,
    pub reply: oneshot::Sender<BrokerResponse>,
}

/// Cheap, cloneable sender side of the broker.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    request_tx: mpsc::Sender<BrokerEnvelope>,
}

impl BrokerHandle {
    /// Send a request and wait for its reply.
    pub async fn request(&self, request: BrokerRequest) -> Result<BrokerResponse, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(BrokerEnvelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AppError::internal("Request broker not running"))?;

        reply_rx
            .await
            .map_err(|_| AppError::internal("Request broker dropped the request"))
    }

    /// Whether the tracker project can be enhanced; any failure reads as no.
    pub async fn is_project_ready(&self, project_name: &str) -> bool {
        let request = BrokerRequest::IsProjectReady {
            project_name: project_name.to_string(),
        };
        let reply = self
            .request(request)
            .await
            .map_err(BrokerFailure::from)
            .and_then(BrokerResponse::into_result);
        match reply {
            Ok(ResponseBody::ProjectReady { is_ready }) => is_ready,
            Ok(_) => false,
            Err(e) => {
                log::warn!("[broker] Readiness check failed: {}", e);
                false
            }
        }
    }

    pub async fn fetch_merge_requests(
        &self,
        project_name: &str,
        issue_ids: &[String],
        cache_only: bool,
        board_scope_key: Option<&str>,
    ) -> Result<MergeRequestsReply, BrokerFailure> {
        let request = BrokerRequest::FetchMergeRequests {
            project_name: project_name.to_string(),
            issue_ids: issue_ids.to_vec(),
            cache_only,
            board_scope_key: board_scope_key.map(str::to_string),
        };
        match self.request(request).await?.into_result()? {
            ResponseBody::MergeRequests(reply) => Ok(reply),
            _ => Err(unexpected_reply()),
        }
    }

    pub async fn fetch_assignee_avatars(
        &self,
        project_name: &str,
        assignee_names: &[String],
        cache_only: bool,
    ) -> Result<AvatarsReply, BrokerFailure> {
        let request = BrokerRequest::FetchAssigneeAvatars {
            project_name: project_name.to_string(),
            assignee_names: assignee_names.to_vec(),
            cache_only,
        };
        match self.request(request).await?.into_result()? {
            ResponseBody::AssigneeAvatars(reply) => Ok(reply),
            _ => Err(unexpected_reply()),
        }
    }
}

fn unexpected_reply() -> BrokerFailure {
    BrokerFailure {
        error: "Unexpected broker reply".to_string(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request: BrokerRequest = serde_json::from_value(json!({
            "type": "FETCH_MERGE_REQUESTS",
            "projectName": "web",
            "issueIds": ["12345"],
            "cacheOnly": true,
            "boardScopeKey": "https://tracker.example.com/projects/web/agile/board"
        }))
        .unwrap();
        assert_eq!(
            request,
            BrokerRequest::FetchMergeRequests {
                project_name: "web".into(),
                issue_ids: vec!["12345".into()],
                cache_only: true,
                board_scope_key: Some(
                    "https://tracker.example.com/projects/web/agile/board".into()
                ),
            }
        );

        let ping: BrokerRequest = serde_json::from_value(json!({"type": "PING"})).unwrap();
        assert_eq!(ping, BrokerRequest::Ping);

        let avatars: BrokerRequest = serde_json::from_value(json!({
            "type": "FETCH_ASSIGNEE_AVATARS",
            "projectName": "web",
            "assigneeNames": ["Ann Lee"]
        }))
        .unwrap();
        assert!(matches!(avatars, BrokerRequest::FetchAssigneeAvatars { cache_only: false, .. }));
    }

    #[test]
    fn test_response_wire_format() {
        let ready = BrokerResponse::success(ResponseBody::ProjectReady { is_ready: true });
        assert_eq!(serde_json::to_value(&ready).unwrap(), json!({"ok": true, "isReady": true}));

        let error = AppError::gitlab_api_full(
            "GitLab token expired or revoked",
            401,
            "/projects/7/merge_requests",
        );
        let failed = BrokerResponse::failed(&error);
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({
                "ok": false,
                "error": "GitLab API error: GitLab token expired or revoked",
                "status": 401
            })
        );
        assert_eq!(failed.into_result().unwrap_err().status, Some(401));

        let ack = BrokerResponse::success(ResponseBody::Ack {});
        assert_eq!(serde_json::to_value(&ack).unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_background_state_tracks_tabs() {
        let state = BackgroundState::new();
        assert!(!state.is_tracker_tab(3).await);
        state.register_tab(3, true).await;
        assert!(state.is_tracker_tab(3).await);
        state.forget_tab(3).await;
        assert!(!state.is_tracker_tab(3).await);
    }
}
