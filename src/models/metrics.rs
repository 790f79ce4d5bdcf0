//! Per-operation request counters.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outbound request telemetry for one logical fetch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetrics {
    pub request_count: u32,
    pub api_request_count: u32,
    pub avatar_request_count: u32,
    pub request_urls: Vec<String>,
}

impl RequestMetrics {
    /// Add another operation's counters into this summary.
    pub fn merge(&mut self, other: &RequestMetrics) {
        self.request_count += other.request_count;
        self.api_request_count += other.api_request_count;
        self.avatar_request_count += other.avatar_request_count;
        self.request_urls.extend(
            other
                .request_urls
                .iter()
                .map(|url| url.trim())
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        );
    }
}

/// Shared recorder handed down the call chain of one fetch.
///
/// Cloning shares the same counters, so concurrent enrichment workers all
/// report into one [`RequestMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    inner: Arc<Mutex<RequestMetrics>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a GitLab REST call.
    pub fn record_api(&self, url: &str) {
        let mut metrics = self.lock();
        metrics.request_count += 1;
        metrics.api_request_count += 1;
        metrics.request_urls.push(url.to_string());
    }

    /// Record an avatar image download.
    pub fn record_avatar(&self, url: &str) {
        let mut metrics = self.lock();
        metrics.request_count += 1;
        metrics.avatar_request_count += 1;
        metrics.request_urls.push(url.to_string());
    }

    pub fn snapshot(&self) -> RequestMetrics {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, RequestMetrics> {
        // Counters stay usable even if a worker panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
