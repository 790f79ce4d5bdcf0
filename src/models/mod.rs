//! Data models for the merge-request pipeline.
//!
//! These are the values that cross the broker boundary or get persisted in
//! the key-value store, so all of them are serde types.

pub mod avatar;
pub mod merge_request;
pub mod metrics;
pub mod settings;

// Re-exports for convenient access
pub use avatar::{ImageCacheEntry, NameCacheEntry};
pub use merge_request::{MergeRequest, MergeRequestState, MergeRequestSummary, Reviewer};
pub use metrics::{MetricsRecorder, RequestMetrics};
pub use settings::{ExtensionSettings, PipelineConfig, ProjectTarget};
