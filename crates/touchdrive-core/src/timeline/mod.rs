//! Clip timeline derived from the event log
//!
//! [`build_timeline`] is a pure function of a log snapshot, the track list
//! and routing, and the current instant. [`spawn_live_timeline`] recomputes
//! it on a tick for live display.

mod builder;
mod live;

pub use builder::build_timeline;
pub use live::spawn_live_timeline;

use crate::config::TimelineTrackConfig;
use crate::events::EventId;
use crate::session::ProductionSession;
use crate::timecode::TimecodeFormat;
use serde::Serialize;
use std::collections::BTreeMap;

/// A span on one track, `[start_frame, end_frame)` from session start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub track_id: String,
    pub start_frame: u64,
    pub end_frame: u64,
    /// Events that opened the clip; several when they share a frame
    pub source_event_ids: Vec<EventId>,
    /// Summary of the last opening event
    pub label: String,
    pub start_timecode: String,
    pub end_timecode: String,
}

impl Clip {
    pub fn duration_frames(&self) -> u64 {
        self.end_frame - self.start_frame
    }
}

/// Clips per track for one session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub session: Option<ProductionSession>,
    /// Enabled tracks in display order
    pub tracks: Vec<TimelineTrackConfig>,
    pub clips: BTreeMap<String, Vec<Clip>>,
    /// Frames from session start to its end, or to now while open
    pub duration_frames: u64,
    pub format: TimecodeFormat,
    pub start_offset: u64,
}

impl Timeline {
    pub fn empty(format: TimecodeFormat, start_offset: u64) -> Self {
        Self {
            session: None,
            tracks: Vec::new(),
            clips: BTreeMap::new(),
            duration_frames: 0,
            format,
            start_offset,
        }
    }

    pub fn track(&self, id: &str) -> &[Clip] {
        self.clips.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clip_count(&self) -> usize {
        self.clips.values().map(Vec::len).sum()
    }

    /// Display timecode of a session-relative frame
    pub fn timecode(&self, frame: u64) -> String {
        self.format
            .to_timecode(self.start_offset + frame)
            .to_string()
    }
}
