//! 暂存目录过期清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::STAGING_CLEAN_INTERVAL_SECS;
use crate::staging::StagingArea;

/// 启动后台任务（暂存目录清理）。
pub fn spawn_background_tasks(staging: Arc<StagingArea>) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match staging.cleanup_stale().await {
                Ok(removed) => debug!(removed, "staging cleanup finished"),
                Err(err) => warn!(error = %err, "staging cleanup failed"),
            }
        }
    });
}
