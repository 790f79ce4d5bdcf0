//! Page-load protocol.
//!
//! On every load the board is painted from cache first and from the network
//! second. Merge-request badges and assignee avatars run as two independent
//! pipelines; an opaque overlay hides the board on reloads until both cached
//! passes are painted.

use crate::models::RequestMetrics;
use crate::renderer::board::BoardSnapshot;
use crate::renderer::patches::{render_avatars, render_merge_requests, RenderMemo, RenderPatch};
use crate::services::broker::BrokerHandle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// How the current page was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationType {
    Navigate,
    Reload,
    BackForward,
    Prerender,
}

impl From<&str> for NavigationType {
    fn from(s: &str) -> Self {
        match s {
            "reload" => Self::Reload,
            "back_forward" => Self::BackForward,
            "prerender" => Self::Prerender,
            _ => Self::Navigate,
        }
    }
}

/// The page surface the protocol drives.
#[async_trait]
pub trait BoardPage: Send + Sync {
    async fn snapshot(&self) -> BoardSnapshot;

    async fn apply(&self, patches: Vec<RenderPatch>);

    fn navigation_type(&self) -> NavigationType;

    /// Whether a loading overlay is already up (e.g. from scroll restore).
    fn overlay_visible(&self) -> bool;

    async fn show_overlay(&self);

    /// Keep the overlay up on behalf of the GitLab pipelines, or let go.
    async fn hold_overlay(&self, hold: bool);

    /// Resolves after the next frame is painted.
    async fn next_paint(&self);
}

/// Outcome of one page-load pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub metrics: RequestMetrics,
    pub duration_ms: u64,
    /// Whether the overlay was held for the cached passes.
    pub held_overlay: bool,
}

/// Releases the overlay once both cached passes have been applied.
///
/// The pipelines only flag their cached pass; the paint-then-release runs as
/// its own branch so network fetches are never held back by it.
struct OverlayGate {
    active: bool,
    merge_requests_cached: AtomicBool,
    avatars_cached: AtomicBool,
    cached_passes_done: Notify,
}

impl OverlayGate {
    fn new(active: bool) -> Self {
        Self {
            active,
            merge_requests_cached: AtomicBool::new(false),
            avatars_cached: AtomicBool::new(false),
            cached_passes_done: Notify::new(),
        }
    }

    fn merge_requests_applied(&self) {
        self.merge_requests_cached.store(true, Ordering::SeqCst);
        self.notify_if_done();
    }

    fn avatars_applied(&self) {
        self.avatars_cached.store(true, Ordering::SeqCst);
        self.notify_if_done();
    }

    fn is_done(&self) -> bool {
        self.merge_requests_cached.load(Ordering::SeqCst)
            && self.avatars_cached.load(Ordering::SeqCst)
    }

    fn notify_if_done(&self) {
        if self.is_done() {
            self.cached_passes_done.notify_one();
        }
    }

    async fn release(&self, page: &dyn BoardPage) {
        if !self.active {
            return;
        }
        while !self.is_done() {
            self.cached_passes_done.notified().await;
        }
        page.next_paint().await;
        page.hold_overlay(false).await;
    }
}

/// Keeps one board's GitLab regions in sync across loads.
pub struct BoardSync {
    page: Arc<dyn BoardPage>,
    broker: BrokerHandle,
    mr_memo: Mutex<RenderMemo>,
    avatar_memo: Mutex<RenderMemo>,
}

impl BoardSync {
    pub fn new(page: Arc<dyn BoardPage>, broker: BrokerHandle) -> Self {
        Self {
            page,
            broker,
            mr_memo: Mutex::new(RenderMemo::new()),
            avatar_memo: Mutex::new(RenderMemo::new()),
        }
    }

    /// Run the cache-then-network protocol once.
    ///
    /// Returns `None` when the page is not a project board.
    pub async fn run(&self) -> Option<LoadSummary> {
        let board = self.page.snapshot().await;
        let project_name = board.project_name.trim().to_string();
        if project_name.is_empty() {
            return None;
        }

        let started = Instant::now();
        let page = self.page.as_ref();
        let issue_ids = board.collect_issue_ids();

        let overlay_at_start = page.overlay_visible();
        let can_create_overlay = !overlay_at_start
            && page.navigation_type() == NavigationType::Reload
            && !issue_ids.is_empty();
        if overlay_at_start {
            page.hold_overlay(true).await;
        }

        let ready = self.broker.is_project_ready(&project_name).await;
        let hold = ready && (overlay_at_start || can_create_overlay);
        if hold && can_create_overlay {
            page.show_overlay().await;
            page.hold_overlay(true).await;
        } else if overlay_at_start && !hold {
            page.hold_overlay(false).await;
        }

        let gate = OverlayGate::new(hold);
        let (mr_metrics, avatar_metrics, ()) = tokio::join!(
            self.sync_merge_requests(&board, &project_name, &issue_ids, &gate),
            self.sync_avatars(&board, &project_name, &gate),
            gate.release(page),
        );

        let mut metrics = RequestMetrics::default();
        metrics.merge(&mr_metrics);
        metrics.merge(&avatar_metrics);

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log::info!(
            "[bluemine] Loaded GitLab info in {:.2} seconds with {} requests ({} ms)",
            duration_ms as f64 / 1000.0,
            metrics.request_count,
            duration_ms
        );

        if hold {
            page.hold_overlay(false).await;
        }

        Some(LoadSummary {
            metrics,
            duration_ms,
            held_overlay: hold,
        })
    }

    async fn sync_merge_requests(
        &self,
        board: &BoardSnapshot,
        project_name: &str,
        issue_ids: &[String],
        gate: &OverlayGate,
    ) -> RequestMetrics {
        let page = self.page.as_ref();
        let mut metrics = RequestMetrics::default();

        if issue_ids.is_empty() {
            let patches = render_merge_requests(&mut *self.mr_memo.lock().await, board, &[], false);
            apply_nonempty(page, patches).await;
            gate.merge_requests_applied();
            return metrics;
        }

        let scope_key = board.board_scope_key();

        match self
            .broker
            .fetch_merge_requests(project_name, issue_ids, true, Some(&scope_key))
            .await
        {
            Ok(reply) => {
                metrics.merge(&reply.request_metrics);
                let mut memo = self.mr_memo.lock().await;
                let patches = render_merge_requests(&mut memo, board, &reply.merge_requests, false);
                apply_nonempty(page, patches).await;
            }
            Err(e) => log::warn!("[bluemine] Failed to load cached GitLab merge requests: {}", e),
        }
        gate.merge_requests_applied();

        match self
            .broker
            .fetch_merge_requests(project_name, issue_ids, false, Some(&scope_key))
            .await
        {
            Ok(reply) => {
                metrics.merge(&reply.request_metrics);
                let mut memo = self.mr_memo.lock().await;
                let patches = render_merge_requests(&mut memo, board, &reply.merge_requests, true);
                apply_nonempty(page, patches).await;
            }
            Err(e) => log::warn!("[bluemine] Failed to load GitLab merge requests: {}", e),
        }

        metrics
    }

    async fn sync_avatars(
        &self,
        board: &BoardSnapshot,
        project_name: &str,
        gate: &OverlayGate,
    ) -> RequestMetrics {
        let page = self.page.as_ref();
        let mut metrics = RequestMetrics::default();

        let names = board.assignee_names();
        if names.is_empty() {
            gate.avatars_applied();
            return metrics;
        }

        let cached = match self.broker.fetch_assignee_avatars(project_name, &names, true).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[bluemine] Failed to load GitLab assignee avatars: {}", e);
                gate.avatars_applied();
                return metrics;
            }
        };
        metrics.merge(&cached.request_metrics);
        let patches =
            render_avatars(&mut *self.avatar_memo.lock().await, board, &cached.avatars_by_name);
        apply_nonempty(page, patches).await;
        gate.avatars_applied();

        let unresolved: Vec<String> = names
            .into_iter()
            .filter(|name| !cached.avatars_by_name.contains_key(name))
            .collect();
        if unresolved.is_empty() {
            return metrics;
        }

        match self.broker.fetch_assignee_avatars(project_name, &unresolved, false).await {
            Ok(reply) => {
                metrics.merge(&reply.request_metrics);
                let mut memo = self.avatar_memo.lock().await;
                let patches = render_avatars(&mut memo, board, &reply.avatars_by_name);
                apply_nonempty(page, patches).await;
            }
            Err(e) => log::warn!("[bluemine] Failed to load GitLab assignee avatars: {}", e),
        }

        metrics
    }
}

async fn apply_nonempty(page: &dyn BoardPage, patches: Vec<RenderPatch>) {
    if !patches.is_empty() {
        page.apply(patches).await;
    }
}
