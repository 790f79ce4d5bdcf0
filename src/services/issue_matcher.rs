//! Linking tracker issues to merge requests.
//!
//! An MR is linked to issues through its title prefix, e.g.
//! `12345, 12346 - Fix login bug`. Cached MRs already carry the parsed
//! `issueIds`, which take precedence over the title.

use crate::models::{MergeRequest, MergeRequestSummary};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;

/// Five-digit issue IDs separated by punctuation, then ` - `.
const MR_TITLE_PREFIX_PATTERN: &str = r"^([0-9]{5}(?:\s*[^0-9]\s*[0-9]{5})*) - ";

fn title_prefix_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(MR_TITLE_PREFIX_PATTERN).expect("valid MR title pattern"))
}

fn issue_id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new("[0-9]{5}").expect("valid issue id pattern"))
}

/// Anything that can be linked to tracker issues.
pub trait IssueLinked {
    fn iid(&self) -> i64;

    /// Pre-computed issue IDs; empty when they must be parsed from the title.
    fn explicit_issue_ids(&self) -> &[String];

    fn title(&self) -> Option<&str>;
}

/// Distinct issue IDs from a conventional MR title, in order of appearance.
pub fn extract_issue_ids_from_title(title: &str) -> Vec<String> {
    let Some(captures) = title_prefix_regex().captures(title) else {
        return Vec::new();
    };
    let Some(prefix) = captures.get(1) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    issue_id_regex()
        .find_iter(prefix.as_str())
        .map(|m| m.as_str().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Trim, keep all-digit IDs, drop duplicates.
pub fn normalize_issue_id_list(issue_ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    issue_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

/// Issue IDs for an MR: explicit IDs when present, else parsed from the title.
pub fn extract_issue_ids<T: IssueLinked + ?Sized>(mr: &T) -> Vec<String> {
    let explicit = normalize_issue_id_list(mr.explicit_issue_ids());
    if !explicit.is_empty() {
        return explicit;
    }

    mr.title().map(extract_issue_ids_from_title).unwrap_or_default()
}

/// Collapse whitespace and lowercase, for comparing people across systems.
pub fn normalize_person_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Issue ID → summaries of every linked MR, most recently updated first.
///
/// Relies on `merge_requests` being in updated-at-descending order.
pub fn build_issue_mr_map(
    merge_requests: &[MergeRequest],
) -> HashMap<String, Vec<MergeRequestSummary>> {
    let mut map: HashMap<String, Vec<MergeRequestSummary>> = HashMap::new();

    for mr in merge_requests {
        let issue_ids = extract_issue_ids(mr);
        if issue_ids.is_empty() {
            continue;
        }

        let summary = MergeRequestSummary::from(mr);
        for issue_id in issue_ids {
            map.entry(issue_id).or_default().push(summary.clone());
        }
    }

    map
}

/// One MR chosen as primary, with the requested issues it claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryClaim {
    pub iid: i64,
    pub issue_ids: Vec<String>,
}

/// Walk MRs in order and let each claim the requested issues nobody has
/// claimed yet. An MR that claims at least one issue is primary.
pub fn primary_merge_request_claims<T: IssueLinked>(
    merge_requests: &[T],
    issue_ids: &BTreeSet<String>,
) -> Vec<PrimaryClaim> {
    let mut unresolved: HashSet<&str> = issue_ids.iter().map(String::as_str).collect();
    let mut claims = Vec::new();

    for mr in merge_requests {
        if unresolved.is_empty() {
            break;
        }

        let claimed: Vec<String> = extract_issue_ids(mr)
            .into_iter()
            .filter(|id| unresolved.remove(id.as_str()))
            .collect();
        if !claimed.is_empty() {
            claims.push(PrimaryClaim {
                iid: mr.iid(),
                issue_ids: claimed,
            });
        }
    }

    claims
}

/// IIDs of the MRs that should receive review-metadata enrichment.
pub fn primary_merge_request_iids<T: IssueLinked>(
    merge_requests: &[T],
    issue_ids: &BTreeSet<String>,
) -> HashSet<i64> {
    primary_merge_request_claims(merge_requests, issue_ids)
        .into_iter()
        .map(|claim| claim.iid)
        .collect()
}
