//! Merge request model.
//!
//! [`MergeRequest`] is the minimal projection that is cached and sent to the
//! page. Everything that is persisted goes through [`MergeRequest::sanitized`]
//! first, and everything read back goes through
//! [`MergeRequest::from_cache_value`], so stale or hand-edited storage heals
//! itself on the next read.

use crate::services::issue_matcher::{self, IssueLinked};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// State of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestState {
    Open,
    Merged,
    Closed,
    Unknown,
}

impl From<&str> for MergeRequestState {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "opened" | "open" => Self::Open,
            "merged" => Self::Merged,
            "closed" => Self::Closed,
            _ => Self::Unknown,
        }
    }
}

impl MergeRequestState {
    /// Badge text shown on the board.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Merged => "Merged",
            Self::Closed => "Closed",
            Self::Unknown => "Unknown",
        }
    }

    /// CSS class applied to the badge link.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Open => "is-open",
            Self::Merged => "is-merged",
            Self::Closed => "is-closed",
            Self::Unknown => "is-unknown",
        }
    }
}

/// A GitLab reviewer as shown next to a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Cached, render-ready merge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    /// Project-scoped MR number.
    pub iid: i64,

    /// Tracker issue IDs this MR is linked to, in title order.
    pub issue_ids: Vec<String>,

    pub state: MergeRequestState,

    /// URL to the MR in the GitLab web UI.
    pub url: String,

    pub reviewers: Vec<Reviewer>,

    /// Only meaningful with at least one reviewer and before merge.
    pub approved: bool,

    pub total_comments: u32,

    /// Never greater than `total_comments` once sanitized.
    pub unresolved_comments: u32,
}

impl MergeRequest {
    /// Reduce to the cache projection, or `None` if the MR must not be cached.
    ///
    /// An MR survives only when it carries at least one issue ID and, for a
    /// non-empty `requested` set, at least one of its IDs is in that set.
    pub fn sanitized(mut self, requested: &BTreeSet<String>) -> Option<Self> {
        self.issue_ids = issue_matcher::normalize_issue_id_list(&self.issue_ids);
        if self.issue_ids.is_empty() {
            return None;
        }
        if !requested.is_empty() && !self.issue_ids.iter().any(|id| requested.contains(id)) {
            return None;
        }

        self.url = self.url.trim().to_string();
        self.reviewers = normalize_reviewers(self.reviewers);
        self.approved =
            self.approved && !self.reviewers.is_empty() && self.state != MergeRequestState::Merged;
        self.unresolved_comments = self.unresolved_comments.min(self.total_comments);

        Some(self)
    }

    /// Leniently rebuild a merge request from persisted JSON.
    ///
    /// Accepts both the cache projection and raw API-like objects (`web_url`,
    /// numeric strings, missing counters). Returns `None` when no `iid` can be
    /// recovered.
    pub fn from_cache_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let iid = match object.get("iid")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };

        let explicit_ids: Vec<String> = object
            .get("issueIds")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(value_to_id_string).collect())
            .unwrap_or_default();
        let issue_ids = if explicit_ids.is_empty() {
            object
                .get("title")
                .and_then(Value::as_str)
                .map(issue_matcher::extract_issue_ids_from_title)
                .unwrap_or_default()
        } else {
            explicit_ids
        };

        let state = object
            .get("state")
            .and_then(Value::as_str)
            .map(MergeRequestState::from)
            .unwrap_or(MergeRequestState::Unknown);
        let url = object
            .get("url")
            .or_else(|| object.get("web_url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reviewers = object
            .get("reviewers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|r| {
                        let name = r.get("name")?.as_str()?.to_string();
                        let url = r
                            .get("url")
                            .or_else(|| r.get("web_url"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        Some(Reviewer { name, url })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            iid,
            issue_ids,
            state,
            url,
            reviewers,
            approved: object.get("approved").and_then(Value::as_bool).unwrap_or(false),
            total_comments: to_non_negative(object.get("totalComments")),
            unresolved_comments: to_non_negative(object.get("unresolvedComments")),
        })
    }
}

impl IssueLinked for MergeRequest {
    fn iid(&self) -> i64 {
        self.iid
    }

    fn explicit_issue_ids(&self) -> &[String] {
        &self.issue_ids
    }

    fn title(&self) -> Option<&str> {
        None
    }
}

/// What the board needs to know about one MR linked to an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequestSummary {
    pub iid: i64,
    pub state: MergeRequestState,
    pub url: String,
    pub reviewers: Vec<Reviewer>,
    pub is_approved: bool,
    pub unresolved_comments: u32,
    pub total_comments: u32,
}

impl MergeRequestSummary {
    pub fn has_reviewer(&self) -> bool {
        !self.reviewers.is_empty()
    }

    pub fn is_merged(&self) -> bool {
        self.state == MergeRequestState::Merged
    }

    /// `(resolved, total)` comment counts.
    pub fn resolved_counts(&self) -> (u32, u32) {
        let unresolved = self.unresolved_comments.min(self.total_comments);
        (self.total_comments - unresolved, self.total_comments)
    }

    /// Badge label: the state, plus `resolved/total` for open MRs with comments.
    pub fn status_label(&self) -> String {
        let label = self.state.label();
        if self.state != MergeRequestState::Open {
            return label.to_string();
        }

        match self.resolved_counts() {
            (_, 0) => label.to_string(),
            (resolved, total) => format!("{} {}/{}", label, resolved, total),
        }
    }
}

impl From<&MergeRequest> for MergeRequestSummary {
    fn from(mr: &MergeRequest) -> Self {
        Self {
            iid: mr.iid,
            state: mr.state,
            url: mr.url.trim().to_string(),
            reviewers: normalize_reviewers(mr.reviewers.clone()),
            is_approved: mr.approved,
            unresolved_comments: mr.unresolved_comments,
            total_comments: mr.total_comments,
        }
    }
}

/// Trim reviewer fields, drop nameless entries and collapse duplicates by
/// normalized name, keeping the first occurrence.
pub fn normalize_reviewers(reviewers: Vec<Reviewer>) -> Vec<Reviewer> {
    let mut seen = HashSet::new();
    reviewers
        .into_iter()
        .filter_map(|reviewer| {
            let name = reviewer.name.trim().to_string();
            let key = issue_matcher::normalize_person_name(&name);
            if key.is_empty() || !seen.insert(key) {
                return None;
            }
            let url = reviewer
                .url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty());
            Some(Reviewer { name, url })
        })
        .collect()
}

fn value_to_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_non_negative(value: Option<&Value>) -> u32 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(n) if n.is_finite() && n >= 0.0 => n.min(u32::MAX as f64) as u32,
        _ => 0,
    }
}
