//! Background tasks for the voxline server.
//!
//! Includes:
//! - Reaping conversations orphaned by streams that never ended cleanly.

use crate::AppState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Starts the conversation reaper.
///
/// Runs indefinitely, removing every conversation that has been idle past
/// the store's TTL and whose session has no running stream.
pub async fn start_reaper_task(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("conversation reaper disabled (interval=0)");
        return;
    }

    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(
        interval_seconds,
        ttl_seconds = state.memory.settings().ttl.as_secs(),
        "starting conversation reaper"
    );

    loop {
        sleep(interval).await;
        reap_orphaned_conversations(&state, Utc::now());
    }
}

/// One reaper sweep as of `now`. Returns the ids of the removed sessions.
pub fn reap_orphaned_conversations(state: &AppState, now: DateTime<Utc>) -> Vec<String> {
    let reaped = state.pipeline.reap_orphaned(now);
    if !reaped.is_empty() {
        tracing::info!(count = reaped.len(), sessions = ?reaped, "reaped orphaned conversations");
    }
    reaped
}
