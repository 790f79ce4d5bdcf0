//! Command palette filtering.
//!
//! The palette lists the board's context-menu entries (status, assignee,
//! tracker, ...) as commands. Queries support a category prefix (`as ann`),
//! status shortcuts (`ip`) and person-name abbreviations (`alx` for
//! "Ann Lex").

use serde::{Deserialize, Serialize};

/// Context-menu folder a command comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCategory {
    Status,
    Assignee,
    Tracker,
    TargetVersion,
    Merged,
    Reviewer,
    Reviewed,
    BulkEdit,
}

impl CommandCategory {
    /// Folders scraped from the context menu.
    pub const CONTEXT_MENU: [CommandCategory; 7] = [
        Self::Status,
        Self::Assignee,
        Self::Tracker,
        Self::TargetVersion,
        Self::Merged,
        Self::Reviewer,
        Self::Reviewed,
    ];

    /// Folder title as the tracker renders it.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Status => "Status",
            Self::Assignee => "Assignee",
            Self::Tracker => "Tracker",
            Self::TargetVersion => "Target version",
            Self::Merged => "Merged",
            Self::Reviewer => "Reviewer",
            Self::Reviewed => "Reviewed",
            Self::BulkEdit => "Bulk Edit",
        }
    }

    /// Category of a context-menu folder title; `None` for folders the
    /// palette does not offer.
    pub fn from_menu_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::CONTEXT_MENU.into_iter().find(|c| c.label() == label)
    }

    /// Two-letter query prefix restricting results to this category.
    pub fn query_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Assignee => Some("as"),
            Self::Reviewer => Some("re"),
            Self::Tracker => Some("tr"),
            Self::TargetVersion => Some("tv"),
            Self::Merged => Some("mg"),
            Self::Reviewed => Some("rd"),
            Self::BulkEdit => Some("be"),
            Self::Status => None,
        }
    }

    fn is_person(&self) -> bool {
        matches!(self, Self::Assignee | Self::Reviewer)
    }
}

/// Status label a bare shortcut query jumps to.
pub fn status_shortcut(query: &str) -> Option<&'static str> {
    match query {
        "cl" => Some("closed"),
        "new" => Some("new"),
        "ip" => Some("in progress"),
        "rs" => Some("resolved"),
        "fb" => Some("feedback"),
        "rj" => Some("rejected"),
        "oh" => Some("on hold"),
        "co" => Some("confirmed"),
        _ => None,
    }
}

/// One palette entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteCommand {
    pub id: String,
    pub category: CommandCategory,
    pub label: String,
    pub disabled: bool,

    /// Target of the bulk-update request; `None` when disabled.
    pub action_url: Option<String>,
}

impl PaletteCommand {
    /// Build a command from a menu entry. Entries without an href, or with
    /// `#`, are disabled.
    pub fn new(category: CommandCategory, label: &str, href: Option<&str>, disabled: bool) -> Self {
        let label = label.trim().to_string();
        let disabled = disabled || matches!(href, None | Some("#"));
        let id = format!("{}-{}", category.label(), label)
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");

        Self {
            id,
            category,
            label,
            disabled,
            action_url: if disabled { None } else { href.map(str::to_string) },
        }
    }
}

/// Whether `query` is a prefix of the name's abbreviation: first letter of
/// the first name, then first and last letter of the last name
/// ("Max Assermark" is "mak").
pub fn matches_person_abbreviation(label: &str, query: &str) -> bool {
    let parts: Vec<&str> = label.split_whitespace().collect();
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return false;
    };
    if parts.len() < 2 {
        return false;
    }

    let letters = [first.chars().next(), last.chars().next(), last.chars().last()];
    let Some(abbreviation) = letters.into_iter().collect::<Option<String>>() else {
        return false;
    };
    let abbreviation = abbreviation.to_lowercase();
    abbreviation.starts_with(query)
}

/// Commands matching `query`, in their original order.
///
/// Resolution order: empty query, `be`, category prefix (`as`, `re`, ...),
/// status shortcut, then substring search over `"<category> <label>"` with
/// abbreviation matching for people.
pub fn filter_commands<'a>(commands: &'a [PaletteCommand], query: &str) -> Vec<&'a PaletteCommand> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return commands.iter().collect();
    }

    if q == "be" {
        return in_category(commands, CommandCategory::BulkEdit).collect();
    }

    for category in CommandCategory::CONTEXT_MENU {
        let Some(prefix) = category.query_prefix() else {
            continue;
        };
        let Some(rest) = q.strip_prefix(prefix) else {
            continue;
        };
        if !rest.is_empty() && !rest.starts_with(' ') {
            continue;
        }

        let name_query = rest.trim();
        return in_category(commands, category)
            .filter(|c| {
                name_query.is_empty()
                    || c.label.to_lowercase().contains(name_query)
                    || matches_person_abbreviation(&c.label, name_query)
            })
            .collect();
    }

    if let Some(status) = status_shortcut(&q) {
        return in_category(commands, CommandCategory::Status)
            .filter(|c| c.label.to_lowercase() == status)
            .collect();
    }

    commands
        .iter()
        .filter(|c| {
            let combined = format!("{} {}", c.category.label(), c.label).to_lowercase();
            combined.contains(&q)
                || (c.category.is_person() && matches_person_abbreviation(&c.label, &q))
        })
        .collect()
}

/// Index to preselect: the first enabled command, else 0.
pub fn first_enabled_index(commands: &[&PaletteCommand]) -> usize {
    commands.iter().position(|c| !c.disabled).unwrap_or(0)
}

fn in_category(
    commands: &[PaletteCommand],
    category: CommandCategory,
) -> impl Iterator<Item = &PaletteCommand> {
    commands.iter().filter(move |c| c.category == category)
}
