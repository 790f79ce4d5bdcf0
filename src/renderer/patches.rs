//! Incremental board rendering.
//!
//! Render functions compare the next view of each board region against the
//! signature memoized from the previous pass and emit [`RenderPatch`]es only
//! for regions whose content changed. Applying the patches is up to the
//! page.

use crate::models::{MergeRequest, MergeRequestSummary, Reviewer};
use crate::renderer::board::BoardSnapshot;
use crate::renderer::signature::render_signature;
use crate::services::issue_matcher::{build_issue_mr_map, normalize_person_name};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// The kinds of board region the renderer owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegionKind {
    /// MR links under a card's issue number.
    CardStatus,
    /// MR links plus reviewer text in a story row header.
    StoryStatus,
    /// The "Reviewer" attribute line of a card.
    CardReviewer,
    /// The assignee avatar of a card.
    AssigneeAvatar,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub kind: RegionKind,
    pub issue_id: String,
}

impl RegionKey {
    pub fn new(kind: RegionKind, issue_id: &str) -> Self {
        Self {
            kind,
            issue_id: issue_id.to_string(),
        }
    }
}

/// One MR link badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MrLinkView {
    pub url: String,
    pub label: String,
    pub class_name: String,
}

/// Contents of a status region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub links: Vec<MrLinkView>,

    /// `Reviewer: a, b`, story rows only.
    pub reviewer_text: Option<String>,

    /// Link behind the reviewer text's icon.
    pub reviewer_url: Option<String>,

    /// Show the "Approved ✓" badge.
    pub approved: bool,
}

impl StatusView {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.reviewer_text.is_none() && !self.approved
    }
}

/// The GitLab-aware "Reviewer" line of a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewerLineView {
    /// Tracker reviewer, `None` renders as "none".
    pub tracker_reviewer: Option<String>,

    /// GitLab reviewers shown in parentheses; empty when they would only
    /// repeat the tracker reviewer.
    pub gitlab_reviewers: Vec<Reviewer>,

    /// Primary MR, linked through the GitLab icon.
    pub mr_url: String,
}

impl ReviewerLineView {
    /// Plain-text rendering, without the icon.
    pub fn text(&self) -> String {
        let base = self.tracker_reviewer.as_deref().unwrap_or("none");
        if self.gitlab_reviewers.is_empty() {
            return format!("Reviewer: {}", base);
        }
        let names: Vec<&str> = self.gitlab_reviewers.iter().map(|r| r.name.as_str()).collect();
        format!("Reviewer: {} ({})", base, names.join(", "))
    }
}

/// A single DOM change for the page to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderPatch {
    SetStatus {
        region: RegionKey,
        view: StatusView,
        animate: bool,
    },
    ClearStatus {
        region: RegionKey,
    },
    /// Replace the tracker's reviewer line with the GitLab-aware one.
    SetReviewerLine {
        issue_id: String,
        view: ReviewerLineView,
        animate: bool,
    },
    /// Drop the GitLab reviewer line and put the tracker's line back.
    RestoreTrackerReviewer {
        issue_id: String,
        name: Option<String>,
    },
    SetAvatar {
        issue_id: String,
        assignee_name: String,
        data_url: String,
    },
}

/// Signatures of what each region currently shows.
#[derive(Debug, Clone, Default)]
pub struct RenderMemo {
    signatures: HashMap<RegionKey, String>,
}

impl RenderMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `next` for `key`; returns whether it differs from the
    /// previous signature. A failed signature always counts as changed.
    fn replace(&mut self, key: &RegionKey, next: Option<String>) -> bool {
        match next {
            Some(signature) => {
                self.signatures.insert(key.clone(), signature.clone()).as_ref() != Some(&signature)
            }
            None => {
                self.signatures.remove(key);
                true
            }
        }
    }

    fn clear(&mut self, key: &RegionKey) -> bool {
        self.signatures.remove(key).is_some()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusSignaturePayload<'a> {
    include_reviewer_badge: bool,
    include_approved_badge: bool,
    merge_requests: &'a [MergeRequestSummary],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewerSignaturePayload<'a> {
    tracker_reviewer: String,
    url: &'a str,
    reviewers: &'a [Reviewer],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AvatarSignaturePayload<'a> {
    assignee_name: &'a str,
    data_url: &'a str,
}

/// Patches bringing every MR region of `board` in line with `merge_requests`.
///
/// `merge_requests` must be in updated-at-descending order; the first MR
/// linked to an issue is its primary one.
pub fn render_merge_requests(
    memo: &mut RenderMemo,
    board: &BoardSnapshot,
    merge_requests: &[MergeRequest],
    animate: bool,
) -> Vec<RenderPatch> {
    let issue_mr_map = build_issue_mr_map(merge_requests);
    let mut patches = Vec::new();

    for card in &board.cards {
        let mrs = related(&issue_mr_map, &card.issue_id);
        let key = RegionKey::new(RegionKind::CardStatus, &card.issue_id);
        render_status(memo, key, mrs, false, animate, &mut patches);
        render_reviewer_line(
            memo,
            &card.issue_id,
            mrs.first(),
            card.tracker_reviewer.as_deref(),
            animate,
            &mut patches,
        );
    }

    for row in &board.story_rows {
        let key = RegionKey::new(RegionKind::StoryStatus, &row.issue_id);
        let mrs = related(&issue_mr_map, &row.issue_id);
        render_status(memo, key, mrs, true, animate, &mut patches);
    }

    patches
}

/// Patches swapping in resolved assignee avatars.
///
/// Cards whose assignee is missing from `avatars_by_name` are left alone.
pub fn render_avatars(
    memo: &mut RenderMemo,
    board: &BoardSnapshot,
    avatars_by_name: &BTreeMap<String, String>,
) -> Vec<RenderPatch> {
    let mut patches = Vec::new();

    for card in &board.cards {
        let Some(name) = card
            .assignee_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        else {
            continue;
        };
        let Some(data_url) = avatars_by_name
            .get(name)
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
        else {
            continue;
        };

        let key = RegionKey::new(RegionKind::AssigneeAvatar, &card.issue_id);
        let signature = render_signature(&AvatarSignaturePayload {
            assignee_name: name,
            data_url,
        })
        .ok();
        if memo.replace(&key, signature) {
            patches.push(RenderPatch::SetAvatar {
                issue_id: card.issue_id.clone(),
                assignee_name: name.to_string(),
                data_url: data_url.to_string(),
            });
        }
    }

    patches
}

fn related<'a>(
    issue_mr_map: &'a HashMap<String, Vec<MergeRequestSummary>>,
    issue_id: &str,
) -> &'a [MergeRequestSummary] {
    issue_mr_map
        .get(issue_id.trim())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn status_view(mrs: &[MergeRequestSummary], include_reviewer: bool) -> StatusView {
    let links = mrs
        .iter()
        .filter(|mr| !mr.url.is_empty())
        .map(|mr| MrLinkView {
            url: mr.url.clone(),
            label: mr.status_label(),
            class_name: mr.state.class_name().to_string(),
        })
        .collect();

    let primary = mrs.first().filter(|mr| mr.has_reviewer());
    let reviewer_text = primary.filter(|_| include_reviewer).map(|mr| {
        let names: Vec<&str> = mr.reviewers.iter().map(|r| r.name.as_str()).collect();
        format!("Reviewer: {}", names.join(", "))
    });
    let reviewer_url = reviewer_text
        .as_ref()
        .and(primary)
        .map(|mr| mr.url.clone())
        .filter(|url| !url.is_empty());

    StatusView {
        links,
        reviewer_text,
        reviewer_url,
        approved: primary.is_some_and(|mr| mr.is_approved && !mr.is_merged()),
    }
}

fn render_status(
    memo: &mut RenderMemo,
    key: RegionKey,
    mrs: &[MergeRequestSummary],
    include_reviewer: bool,
    animate: bool,
    patches: &mut Vec<RenderPatch>,
) {
    let view = status_view(mrs, include_reviewer);
    if mrs.is_empty() || view.is_empty() {
        if memo.clear(&key) {
            patches.push(RenderPatch::ClearStatus { region: key });
        }
        return;
    }

    let signature = render_signature(&StatusSignaturePayload {
        include_reviewer_badge: include_reviewer,
        include_approved_badge: true,
        merge_requests: mrs,
    })
    .ok();
    if memo.replace(&key, signature) {
        patches.push(RenderPatch::SetStatus {
            region: key,
            view,
            animate,
        });
    }
}

fn render_reviewer_line(
    memo: &mut RenderMemo,
    issue_id: &str,
    primary: Option<&MergeRequestSummary>,
    tracker_reviewer: Option<&str>,
    animate: bool,
    patches: &mut Vec<RenderPatch>,
) {
    let key = RegionKey::new(RegionKind::CardReviewer, issue_id);
    let tracker_reviewer = tracker_reviewer.map(str::trim).filter(|name| !name.is_empty());

    let Some(primary) = primary.filter(|mr| mr.has_reviewer()) else {
        if memo.clear(&key) {
            patches.push(RenderPatch::RestoreTrackerReviewer {
                issue_id: issue_id.to_string(),
                name: tracker_reviewer.map(str::to_string),
            });
        }
        return;
    };

    let normalized_tracker = tracker_reviewer.map(normalize_person_name).unwrap_or_default();
    let signature = render_signature(&ReviewerSignaturePayload {
        tracker_reviewer: normalized_tracker.clone(),
        url: &primary.url,
        reviewers: &primary.reviewers,
    })
    .ok();
    if !memo.replace(&key, signature) {
        return;
    }

    let repeats_tracker = !normalized_tracker.is_empty()
        && primary.reviewers.len() == 1
        && normalize_person_name(&primary.reviewers[0].name) == normalized_tracker;

    patches.push(RenderPatch::SetReviewerLine {
        issue_id: issue_id.to_string(),
        view: ReviewerLineView {
            tracker_reviewer: tracker_reviewer.map(str::to_string),
            gitlab_reviewers: if repeats_tracker {
                Vec::new()
            } else {
                primary.reviewers.clone()
            },
            mr_url: primary.url.clone(),
        },
        animate,
    });
}
