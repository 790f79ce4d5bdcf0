//! Business logic services.
//!
//! This module contains the merge-request pipeline: the GitLab client, issue
//! matching, enrichment, the persisted caches and the request broker that
//! serves them to the page.
//!
//! Services depend on the [`KeyValueStore`](crate::db::KeyValueStore) and
//! [`GitLabApi`] traits rather than on a concrete backend, so tests can swap
//! both out.

pub mod avatar;
pub mod broker;
pub mod gitlab_client;
pub mod issue_matcher;
pub mod merge_requests;
pub mod mr_cache;
pub mod settings;

pub use avatar::AvatarService;
pub use broker::{
    BackgroundState, BrokerHandle, BrokerRequest, BrokerResponse, GitLabApiFactory,
    HttpGitLabApiFactory, RequestBroker,
};
pub use gitlab_client::{GitLabApi, GitLabClient};
pub use merge_requests::fetch_merge_requests_for_issues;
pub use mr_cache::{CacheScope, MergeRequestCache};
