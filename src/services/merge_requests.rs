//! Merge-request fetch and enrichment pipeline.
//!
//! Lists a project's MRs, keeps the ones linked to the requested issues and
//! enriches only the primary MR of each issue with approval and comment data.
//! Enrichment lookups are best-effort: a failed lookup falls back to
//! "not approved, no comments" and is logged.

use crate::error::AppError;
use crate::models::{MergeRequest, MergeRequestState, MetricsRecorder, PipelineConfig, Reviewer};
use crate::services::gitlab_client::{GitLabApi, GitLabDiscussion, GitLabMergeRequest};
use crate::services::issue_matcher::{extract_issue_ids, primary_merge_request_iids};
use chrono::{DateTime, FixedOffset};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Review metadata attached to a primary MR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewEnrichment {
    pub approved: bool,
    pub total_comments: u32,
    pub unresolved_comments: u32,
}

/// Fetch the MRs relevant to `target_issue_ids`, enriched and sanitized.
///
/// An empty target set keeps every linked MR; that mode is only used to
/// repair caches. The returned list is in updated-at-descending order.
pub async fn fetch_merge_requests_for_issues(
    api: &dyn GitLabApi,
    project_id: &str,
    target_issue_ids: &BTreeSet<String>,
    config: &PipelineConfig,
    metrics: &MetricsRecorder,
) -> Result<Vec<MergeRequest>, AppError> {
    let mut listed = api.list_merge_requests(project_id, metrics).await?;
    sort_by_updated_desc(&mut listed);

    let relevant: Vec<GitLabMergeRequest> = listed
        .into_iter()
        .filter(|mr| {
            let issue_ids = extract_issue_ids(mr);
            !issue_ids.is_empty()
                && (target_issue_ids.is_empty()
                    || issue_ids.iter().any(|id| target_issue_ids.contains(id)))
        })
        .collect();

    let claim_set: BTreeSet<String> = if target_issue_ids.is_empty() {
        relevant.iter().flat_map(extract_issue_ids).collect()
    } else {
        target_issue_ids.clone()
    };
    let primary_iids = primary_merge_request_iids(&relevant, &claim_set);

    let primaries: Vec<GitLabMergeRequest> = relevant
        .iter()
        .filter(|mr| primary_iids.contains(&mr.iid))
        .cloned()
        .collect();
    let enrichments = enrich_primary_merge_requests(
        api,
        project_id,
        primaries,
        config.enrichment_concurrency,
        metrics,
    )
    .await;

    log::debug!(
        "[merge_requests] project {}: {} linked MRs, {} enriched",
        project_id,
        relevant.len(),
        enrichments.len()
    );

    Ok(relevant
        .iter()
        .filter_map(|mr| {
            let enrichment = enrichments.get(&mr.iid).copied().unwrap_or_default();
            to_cache_projection(mr, enrichment).sanitized(target_issue_ids)
        })
        .collect())
}

/// Enrich MRs with at most `concurrency` of them in flight at once.
///
/// Each worker owns its MR so the returned future stays `Send`.
pub async fn enrich_primary_merge_requests(
    api: &dyn GitLabApi,
    project_id: &str,
    merge_requests: Vec<GitLabMergeRequest>,
    concurrency: usize,
    metrics: &MetricsRecorder,
) -> HashMap<i64, ReviewEnrichment> {
    let mut seen = HashSet::new();
    let queue: Vec<GitLabMergeRequest> = merge_requests
        .into_iter()
        .filter(|mr| seen.insert(mr.iid))
        .collect();

    stream::iter(queue)
        .map(|mr| async move {
            let enrichment = enrich_merge_request(api, project_id, &mr, metrics).await;
            (mr.iid, enrichment)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Approval and comment lookups for one MR.
///
/// Approvals are skipped for merged MRs and MRs without a named reviewer;
/// discussions are skipped for merged MRs and when the note-count hint is 0.
pub async fn enrich_merge_request(
    api: &dyn GitLabApi,
    project_id: &str,
    mr: &GitLabMergeRequest,
    metrics: &MetricsRecorder,
) -> ReviewEnrichment {
    let merged = MergeRequestState::from(mr.state.as_str()) == MergeRequestState::Merged;

    let approved = if merged || mr.named_reviewers().next().is_none() {
        false
    } else {
        match api.get_mr_approvals(project_id, mr.iid, metrics).await {
            Ok(approvals) => !approvals.approved_by.is_empty(),
            Err(e) => {
                log::warn!("[merge_requests] Failed to fetch approvals for MR !{}: {}", mr.iid, e);
                false
            }
        }
    };

    let (total_comments, unresolved_comments) = if merged || mr.user_notes_count == Some(0) {
        (0, 0)
    } else {
        match api.list_discussions(project_id, mr.iid, metrics).await {
            Ok(discussions) => comment_stats(&discussions),
            Err(e) => {
                log::warn!(
                    "[merge_requests] Failed to fetch discussions for MR !{}: {}",
                    mr.iid,
                    e
                );
                (0, 0)
            }
        }
    };

    ReviewEnrichment {
        approved,
        total_comments,
        unresolved_comments,
    }
}

/// `(total, unresolved)`: non-system notes, and of those the resolvable ones
/// not yet resolved.
pub fn comment_stats(discussions: &[GitLabDiscussion]) -> (u32, u32) {
    discussions
        .iter()
        .flat_map(|discussion| discussion.notes.iter())
        .filter(|note| !note.system)
        .fold((0, 0), |(total, unresolved), note| {
            let open = note.resolvable && !note.resolved.unwrap_or(false);
            (total + 1, unresolved + u32::from(open))
        })
}

/// Stable sort, newest `updated_at` first; unparseable timestamps go last.
///
/// The list endpoint is already asked for this order; sorting again keeps
/// primary selection deterministic if the server ignores the parameters.
pub fn sort_by_updated_desc(merge_requests: &mut [GitLabMergeRequest]) {
    merge_requests.sort_by_cached_key(|mr| {
        std::cmp::Reverse(
            mr.updated_at
                .as_deref()
                .and_then(|ts| DateTime::<FixedOffset>::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.timestamp_millis()),
        )
    });
}

fn to_cache_projection(mr: &GitLabMergeRequest, enrichment: ReviewEnrichment) -> MergeRequest {
    MergeRequest {
        iid: mr.iid,
        issue_ids: extract_issue_ids(mr),
        state: MergeRequestState::from(mr.state.as_str()),
        url: mr.web_url.clone(),
        reviewers: mr
            .named_reviewers()
            .map(|user| Reviewer {
                name: user.name.clone(),
                url: user.web_url.clone(),
            })
            .collect(),
        approved: enrichment.approved,
        total_comments: enrichment.total_comments,
        unresolved_comments: enrichment.unresolved_comments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gitlab_client::GitLabDiscussionNote;

    fn note(system: bool, resolvable: bool, resolved: Option<bool>) -> GitLabDiscussionNote {
        GitLabDiscussionNote {
            id: 0,
            system,
            resolvable,
            resolved,
        }
    }

    fn mr(iid: i64, updated_at: Option<&str>) -> GitLabMergeRequest {
        serde_json::from_value(serde_json::json!({
            "iid": iid,
            "title": "12345 - x",
            "updated_at": updated_at,
        }))
        .unwrap()
    }

    #[test]
    fn test_comment_stats_ignores_system_notes() {
        let discussions = vec![
            GitLabDiscussion {
                id: "a".into(),
                notes: vec![note(false, true, Some(false)), note(false, true, Some(true))],
            },
            GitLabDiscussion {
                id: "b".into(),
                notes: vec![note(true, false, None), note(false, false, None)],
            },
        ];
        assert_eq!(comment_stats(&discussions), (3, 1));
        assert_eq!(comment_stats(&[]), (0, 0));
    }

    #[test]
    fn test_sort_by_updated_desc_is_stable() {
        let mut list = vec![
            mr(1, Some("2024-01-01T10:00:00Z")),
            mr(2, None),
            mr(3, Some("2024-03-01T10:00:00.000+02:00")),
            mr(4, Some("2024-01-01T10:00:00Z")),
        ];
        sort_by_updated_desc(&mut list);
        let order: Vec<i64> = list.iter().map(|m| m.iid).collect();
        assert_eq!(order, vec![3, 1, 4, 2]);
    }
}
