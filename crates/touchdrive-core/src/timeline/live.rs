//! Periodic timeline recomputation

use super::{build_timeline, Timeline};
use crate::config::TimelineConfig;
use crate::session::SessionManager;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Recompute the timeline every `period` and publish it
///
/// The task ends once every receiver is dropped.
pub fn spawn_live_timeline(
    sessions: SessionManager,
    config: TimelineConfig,
    period: Duration,
) -> (watch::Receiver<Timeline>, JoinHandle<()>) {
    let (format, offset) = sessions.timecode_format();
    let (tx, rx) = watch::channel(Timeline::empty(format, offset));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let snapshot = sessions.snapshot();
            let timeline = build_timeline(&snapshot, &config.tracks, &config.routing, Utc::now());
            if tx.send(timeline).is_err() {
                tracing::debug!("Live timeline has no receivers, stopping");
                break;
            }
        }
    });

    (rx, handle)
}
