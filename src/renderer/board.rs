//! What the renderer knows about the tracker board.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One issue card on the board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCard {
    pub issue_id: String,

    /// Assignee display name as the tracker shows it.
    #[serde(default)]
    pub assignee_name: Option<String>,

    /// The tracker's own "Reviewer" attribute, remembered across renders.
    #[serde(default)]
    pub tracker_reviewer: Option<String>,
}

/// A swimlane header row for a parent story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRow {
    pub issue_id: String,
}

/// The board as scraped at the start of a render pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    /// Tracker project identifier; empty when the page is not a board.
    pub project_name: String,

    /// Current page URL, used to tell saved board views apart.
    pub page_url: String,

    pub cards: Vec<IssueCard>,
    pub story_rows: Vec<StoryRow>,
}

impl BoardSnapshot {
    /// Distinct numeric issue IDs of cards and story rows, in board order.
    pub fn collect_issue_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.cards
            .iter()
            .map(|card| card.issue_id.as_str())
            .chain(self.story_rows.iter().map(|row| row.issue_id.as_str()))
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .filter(|id| seen.insert(id.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Distinct, trimmed assignee names.
    pub fn assignee_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.cards
            .iter()
            .filter_map(|card| card.assignee_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter(|name| seen.insert(name.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Cache partition for this board view: the normalized page URL, or the
    /// project name when the URL does not parse.
    pub fn board_scope_key(&self) -> String {
        normalize_page_url(&self.page_url).unwrap_or_else(|| self.project_name.trim().to_string())
    }
}

/// `origin + path + query`, trailing slashes trimmed and the fragment dropped.
pub fn normalize_page_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !parsed.has_host() {
        return None;
    }

    let path = match parsed.path() {
        "/" => "/",
        other => other.trim_end_matches('/'),
    };
    let query = parsed.query().map(|q| format!("?{}", q)).unwrap_or_default();

    Some(format!("{}{}{}", parsed.origin().ascii_serialization(), path, query))
}
