//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bluemine_lib::db::{KeyValueStore, MemoryKvStore};
use bluemine_lib::error::AppError;
use bluemine_lib::models::settings::{
    GITLAB_API_KEY_KEY, GITLAB_BASE_URL_KEY, GITLAB_MR_FEATURE_KEY, GITLAB_PROJECT_MAP_KEY,
};
use bluemine_lib::models::{MetricsRecorder, PipelineConfig, ProjectTarget};
use bluemine_lib::services::gitlab_client::{
    AvatarImage, GitLabApi, GitLabDiscussion, GitLabMergeRequest, GitLabUser, MergeRequestApprovals,
};
use bluemine_lib::services::GitLabApiFactory;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_URL: &str = "https://git.example.com";
pub const PROJECT_ID: &str = "7";

/// In-memory GitLab with call counters.
#[derive(Default)]
pub struct FakeGitLab {
    pub merge_requests: Vec<GitLabMergeRequest>,
    pub members: Vec<GitLabUser>,
    pub approvers: HashMap<i64, Vec<String>>,
    pub discussions: HashMap<i64, Vec<GitLabDiscussion>>,

    /// Latency of approval and discussion lookups.
    pub enrichment_delay: Option<Duration>,

    pub fail_list: AtomicBool,
    pub fail_approvals: AtomicBool,
    pub fail_members: AtomicBool,
    pub fail_avatars: AtomicBool,

    pub list_calls: AtomicUsize,
    pub member_calls: AtomicUsize,
    pub approval_calls: AtomicUsize,
    pub discussion_calls: AtomicUsize,
    pub avatar_calls: AtomicUsize,

    pub approval_iids: Mutex<Vec<i64>>,
    pub discussion_iids: Mutex<Vec<i64>>,

    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeGitLab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
            + self.member_calls.load(Ordering::SeqCst)
            + self.approval_calls.load(Ordering::SeqCst)
            + self.discussion_calls.load(Ordering::SeqCst)
            + self.avatar_calls.load(Ordering::SeqCst)
    }

    async fn enrichment_call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        match self.enrichment_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GitLabApi for FakeGitLab {
    async fn list_merge_requests(
        &self,
        project_id: &str,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabMergeRequest>, AppError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        metrics.record_api(&format!("{}/api/v4/projects/{}/merge_requests", BASE_URL, project_id));
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(AppError::protocol(
                "Expected a JSON array on page 1",
                "/projects/7/merge_requests",
            ));
        }
        Ok(self.merge_requests.clone())
    }

    async fn list_project_members(
        &self,
        project_id: &str,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabUser>, AppError> {
        self.member_calls.fetch_add(1, Ordering::SeqCst);
        metrics.record_api(&format!("{}/api/v4/projects/{}/members/all", BASE_URL, project_id));
        if self.fail_members.load(Ordering::SeqCst) {
            return Err(AppError::gitlab_api_full("Access denied", 403, "/projects/7/members/all"));
        }
        Ok(self.members.clone())
    }

    async fn get_mr_approvals(
        &self,
        _project_id: &str,
        mr_iid: i64,
        metrics: &MetricsRecorder,
    ) -> Result<MergeRequestApprovals, AppError> {
        self.approval_calls.fetch_add(1, Ordering::SeqCst);
        self.approval_iids.lock().unwrap().push(mr_iid);
        metrics.record_api(&format!("approvals/{}", mr_iid));
        self.enrichment_call().await;

        if self.fail_approvals.load(Ordering::SeqCst) {
            return Err(AppError::network("connection reset"));
        }
        let approved_by: Vec<Value> = self
            .approvers
            .get(&mr_iid)
            .into_iter()
            .flatten()
            .map(|name| json!({"user": {"name": name}}))
            .collect();
        Ok(serde_json::from_value(json!({ "approved_by": approved_by })).unwrap())
    }

    async fn list_discussions(
        &self,
        _project_id: &str,
        mr_iid: i64,
        metrics: &MetricsRecorder,
    ) -> Result<Vec<GitLabDiscussion>, AppError> {
        self.discussion_calls.fetch_add(1, Ordering::SeqCst);
        self.discussion_iids.lock().unwrap().push(mr_iid);
        metrics.record_api(&format!("discussions/{}", mr_iid));
        self.enrichment_call().await;
        Ok(self.discussions.get(&mr_iid).cloned().unwrap_or_default())
    }

    async fn download_avatar(
        &self,
        url: &str,
        metrics: &MetricsRecorder,
    ) -> Result<AvatarImage, AppError> {
        self.avatar_calls.fetch_add(1, Ordering::SeqCst);
        metrics.record_avatar(url);
        if self.fail_avatars.load(Ordering::SeqCst) {
            return Err(AppError::network("avatar host unreachable"));
        }
        Ok(AvatarImage {
            bytes: url.as_bytes().to_vec(),
            content_type: "image/png".to_string(),
        })
    }
}

/// Hands the same fake to every request.
pub struct FakeFactory(pub Arc<FakeGitLab>);

impl GitLabApiFactory for FakeFactory {
    fn create(
        &self,
        _target: &ProjectTarget,
        _config: &PipelineConfig,
    ) -> Result<Arc<dyn GitLabApi>, AppError> {
        let api: Arc<dyn GitLabApi> = self.0.clone();
        Ok(api)
    }
}

pub fn merge_request(
    iid: i64,
    title: &str,
    updated_at: &str,
    reviewers: &[&str],
    notes: i64,
) -> GitLabMergeRequest {
    let reviewers: Vec<Value> = reviewers
        .iter()
        .enumerate()
        .map(|(i, name)| json!({"id": i + 1, "username": format!("r{}", i), "name": name}))
        .collect();
    serde_json::from_value(json!({
        "iid": iid,
        "title": title,
        "state": "opened",
        "web_url": format!("{}/group/app/-/merge_requests/{}", BASE_URL, iid),
        "updated_at": updated_at,
        "reviewers": reviewers,
        "user_notes_count": notes,
    }))
    .unwrap()
}

pub fn discussion(notes: Value) -> GitLabDiscussion {
    serde_json::from_value(json!({"id": "d", "notes": notes})).unwrap()
}

pub fn member(id: i64, name: &str) -> GitLabUser {
    serde_json::from_value(json!({
        "id": id,
        "username": format!("user{}", id),
        "name": name,
        "avatar_url": format!("{}/uploads/-/system/user/avatar/{}/avatar.png", BASE_URL, id),
    }))
    .unwrap()
}

pub fn target() -> ProjectTarget {
    ProjectTarget {
        base_url: BASE_URL.to_string(),
        host: "git.example.com".to_string(),
        api_key: "glpat-test".to_string(),
        project_id: PROJECT_ID.to_string(),
    }
}

/// A store with the feature enabled and `web` mapped to project 7.
pub async fn configured_store() -> Arc<MemoryKvStore> {
    let store = Arc::new(MemoryKvStore::new());
    store.set(GITLAB_MR_FEATURE_KEY, json!(true)).await.unwrap();
    store.set(GITLAB_BASE_URL_KEY, json!(format!("{}/", BASE_URL))).await.unwrap();
    store.set(GITLAB_API_KEY_KEY, json!("glpat-test")).await.unwrap();
    store
        .set(GITLAB_PROJECT_MAP_KEY, json!(format!("# tracker=gitlab\nweb={}", PROJECT_ID)))
        .await
        .unwrap();
    store
}
