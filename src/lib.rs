//! Bluemine - GitLab merge-request status for Redmine agile boards.
//!
//! This is the core library behind the extension: it matches tracker issues
//! to GitLab merge requests, caches the results, resolves assignee avatars
//! and keeps a board's badges in sync through the [`renderer`] module.

pub mod db;
pub mod error;
pub mod models;
pub mod renderer;
pub mod services;

use db::{KeyValueStore, SqliteKvStore};
use error::AppError;
use models::PipelineConfig;
use services::{BackgroundState, BrokerHandle, HttpGitLabApiFactory, RequestBroker};
use std::path::Path;
use std::sync::Arc;

/// Open the on-disk store under `data_dir` and start the request broker.
///
/// Must be called from within a tokio runtime.
pub async fn start(data_dir: &Path, config: PipelineConfig) -> Result<BrokerHandle, AppError> {
    let db_path = db::get_db_path(data_dir);
    let pool = db::initialize(&db_path).await?;
    log::info!("[bluemine] Cache database ready at {}", db_path.display());

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteKvStore::new(pool));
    let broker = RequestBroker::new(
        store,
        Arc::new(BackgroundState::new()),
        Arc::new(HttpGitLabApiFactory),
        config,
    );

    Ok(broker.start_background())
}
