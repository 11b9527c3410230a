//! Sweeper — background staleness pruning across every live room.
//!
//! DESIGN
//! ======
//! Heartbeats already prune the rooms that still have a connected client.
//! The sweeper covers the rest: rooms whose every client vanished without
//! a leave. Each pass prunes rooms concurrently and a failing room never
//! stops the pass or the task.

use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::services::room::RoomManager;

/// Rooms pruned in parallel within one pass.
const SWEEP_CONCURRENCY: usize = 16;

/// Totals for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rooms_checked: usize,
    pub members_pruned: usize,
    pub rooms_deleted: usize,
    pub rooms_failed: usize,
}

/// Run `sweep_once` every `interval` until the handle is aborted.
pub fn spawn_sweeper(rooms: RoomManager, interval: Duration, stale_threshold_ms: i64) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), stale_threshold_ms, "stale sweeper configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = sweep_once(&rooms, stale_threshold_ms).await;
            if report.members_pruned > 0 || report.rooms_failed > 0 {
                info!(?report, "stale sweep finished");
            } else {
                debug!(rooms = report.rooms_checked, "stale sweep found nothing");
            }
        }
    })
}

/// Prune every live room once.
pub async fn sweep_once(rooms: &RoomManager, stale_threshold_ms: i64) -> SweepReport {
    let codes = match rooms.live_rooms().await {
        Ok(codes) => codes,
        Err(e) => {
            error!(error = %e, "stale sweep could not list rooms");
            return SweepReport { rooms_failed: 1, ..SweepReport::default() };
        }
    };

    let mut report = SweepReport { rooms_checked: codes.len(), ..SweepReport::default() };
    let results: Vec<_> = futures::stream::iter(codes)
        .map(|code| async move {
            let result = rooms.prune_stale(&code, stale_threshold_ms).await;
            (code, result)
        })
        .buffer_unordered(SWEEP_CONCURRENCY)
        .collect()
        .await;

    for (code, result) in results {
        match result {
            Ok(outcome) => {
                report.members_pruned += outcome.pruned.len();
                report.rooms_deleted += usize::from(outcome.room_deleted);
            }
            Err(e) => {
                warn!(%code, error = %e, "stale sweep failed for room; continuing");
                report.rooms_failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
#[path = "sweeper_test.rs"]
mod tests;
