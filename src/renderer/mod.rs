//! Board rendering.
//!
//! Turns merge-request and avatar data into patches for the tracker board and
//! drives the cache-then-network page-load protocol.

pub mod board;
pub mod palette;
pub mod patches;
pub mod signature;
pub mod sync;

pub use board::{BoardSnapshot, IssueCard, StoryRow};
pub use palette::{filter_commands, matches_person_abbreviation, CommandCategory, PaletteCommand};
pub use patches::{
    render_avatars, render_merge_requests, RegionKey, RegionKind, RenderMemo, RenderPatch,
};
pub use sync::{BoardPage, BoardSync, LoadSummary, NavigationType};
