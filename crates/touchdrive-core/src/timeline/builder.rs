//! Clip derivation

use super::{Clip, Timeline};
use crate::config::{TimelineTrackConfig, TrackRule};
use crate::events::{EventId, ProductionEvent};
use crate::session::LogSnapshot;
use chrono::{DateTime, Utc};

struct OpenClip {
    start: u64,
    ids: Vec<EventId>,
    label: String,
}

/// Derive per-track clips for the snapshot's session
///
/// Boundary events routed to a track close the track's open clip at their
/// frame and open the next one. The last clip runs to the session end, or to
/// `now` while the session is open. Events sharing a frame merge into one
/// clip; nothing is placed before a track's first boundary.
///
/// # Arguments
/// * `snapshot` - Log, session and timecode format at one instant
/// * `tracks` - Track list; disabled tracks are skipped
/// * `routing` - Which events land on which track
/// * `now` - Live instant bounding an open session
pub fn build_timeline(
    snapshot: &LogSnapshot,
    tracks: &[TimelineTrackConfig],
    routing: &[TrackRule],
    now: DateTime<Utc>,
) -> Timeline {
    let mut enabled: Vec<TimelineTrackConfig> =
        tracks.iter().filter(|t| t.is_enabled).cloned().collect();
    enabled.sort_by_key(|t| t.order);

    let mut timeline = Timeline::empty(snapshot.format, snapshot.start_offset);
    let Some(session) = &snapshot.session else {
        timeline.tracks = enabled;
        return timeline;
    };

    let format = snapshot.format;
    let end = match session.end_time {
        Some(end_time) => end_time.min(now),
        None => now,
    };
    let duration = format.frames_for_duration(end - session.start_time);
    timeline.duration_frames = duration;
    timeline.session = Some(session.clone());

    let mut boundaries: Vec<&ProductionEvent> = snapshot
        .events
        .iter()
        .filter(|e| session.contains(e.id) && e.kind.is_boundary())
        .collect();
    // Stable: equal timestamps keep log order
    boundaries.sort_by_key(|e| e.timestamp);

    for track in &enabled {
        let rules: Vec<&TrackRule> = routing.iter().filter(|r| r.track == track.id).collect();
        let mut clips = Vec::new();
        let mut open: Option<OpenClip> = None;

        for event in boundaries
            .iter()
            .filter(|e| rules.iter().any(|r| r.matches(&e.payload)))
        {
            let frame = format
                .frames_for_duration(event.timestamp - session.start_time)
                .min(duration);

            match open.take() {
                Some(mut current) if current.start == frame => {
                    current.ids.push(event.id);
                    current.label = event.summary();
                    open = Some(current);
                }
                previous => {
                    if let Some(previous) = previous {
                        close_clip(&timeline, &track.id, previous, frame, &mut clips);
                    }
                    open = Some(OpenClip {
                        start: frame,
                        ids: vec![event.id],
                        label: event.summary(),
                    });
                }
            }
        }
        if let Some(last) = open {
            close_clip(&timeline, &track.id, last, duration, &mut clips);
        }
        timeline.clips.insert(track.id.clone(), clips);
    }

    timeline.tracks = enabled;
    timeline
}

/// Push `clip` ending at `end_frame`, dropping it when empty
fn close_clip(
    timeline: &Timeline,
    track_id: &str,
    clip: OpenClip,
    end_frame: u64,
    clips: &mut Vec<Clip>,
) {
    if end_frame <= clip.start {
        return;
    }
    clips.push(Clip {
        track_id: track_id.to_string(),
        start_frame: clip.start,
        end_frame,
        source_event_ids: clip.ids,
        label: clip.label,
        start_timecode: timeline.timecode(clip.start),
        end_timecode: timeline.timecode(end_frame),
    });
}
