//! Normalized production events
//!
//! Every protocol client reports its state changes as an [`EventDraft`]
//! (kind-specific payload + the wall-clock instant it was observed). The
//! session layer turns drafts into immutable [`ProductionEvent`]s by
//! assigning an id and a session-relative timecode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an event, assigned in log order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ProgramCut,
    Transition,
    KeyerOn,
    KeyerOff,
    SlideChange,
    FadeToBlack,
    RecordStart,
    RecordStop,
    ConnectionChange,
    FileTransfer,
}

impl EventKind {
    /// Kinds that denote a change of production state and therefore
    /// start a new clip on the timeline
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            EventKind::ProgramCut
                | EventKind::Transition
                | EventKind::KeyerOn
                | EventKind::KeyerOff
                | EventKind::SlideChange
                | EventKind::FadeToBlack
        )
    }
}

/// How a program change was performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    Cut,
    Auto,
    /// Source changed but the protocol does not say how
    Unknown,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Cut => write!(f, "cut"),
            TransitionKind::Auto => write!(f, "auto"),
            TransitionKind::Unknown => write!(f, "transition"),
        }
    }
}

/// Kind-specific event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum EventPayload {
    ProgramCut {
        source_index: u16,
        source_name: String,
        bus_name: String,
    },
    Transition {
        source_index: u16,
        source_name: String,
        bus_name: String,
        transition_kind: TransitionKind,
    },
    KeyerOn {
        me_number: u8,
        keyer_number: u8,
    },
    KeyerOff {
        me_number: u8,
        keyer_number: u8,
    },
    SlideChange {
        presentation_name: String,
        slide_index: u32,
        slide_text: String,
    },
    FadeToBlack {
        me_number: u8,
    },
    RecordStart {
        device: String,
        timecode: Option<String>,
        clip_id: Option<u32>,
    },
    RecordStop {
        device: String,
        timecode: Option<String>,
        clip_id: Option<u32>,
    },
    ConnectionChange {
        service_name: String,
        connected: bool,
        detail: String,
    },
    FileTransfer {
        file_name: String,
        detail: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ProgramCut { .. } => EventKind::ProgramCut,
            EventPayload::Transition { .. } => EventKind::Transition,
            EventPayload::KeyerOn { .. } => EventKind::KeyerOn,
            EventPayload::KeyerOff { .. } => EventKind::KeyerOff,
            EventPayload::SlideChange { .. } => EventKind::SlideChange,
            EventPayload::FadeToBlack { .. } => EventKind::FadeToBlack,
            EventPayload::RecordStart { .. } => EventKind::RecordStart,
            EventPayload::RecordStop { .. } => EventKind::RecordStop,
            EventPayload::ConnectionChange { .. } => EventKind::ConnectionChange,
            EventPayload::FileTransfer { .. } => EventKind::FileTransfer,
        }
    }

    /// One-line human-readable description
    pub fn summary(&self) -> String {
        match self {
            EventPayload::ProgramCut {
                source_index,
                source_name,
                bus_name,
            } => format!("{}: cut to {} ({})", bus_name, source_name, source_index),
            EventPayload::Transition {
                source_index,
                source_name,
                bus_name,
                transition_kind,
            } => format!(
                "{}: {} to {} ({})",
                bus_name, transition_kind, source_name, source_index
            ),
            EventPayload::KeyerOn {
                me_number,
                keyer_number,
            } => format!("ME{} key {} on", me_number, keyer_number),
            EventPayload::KeyerOff {
                me_number,
                keyer_number,
            } => format!("ME{} key {} off", me_number, keyer_number),
            EventPayload::SlideChange {
                presentation_name,
                slide_index,
                slide_text,
            } => {
                let first_line = slide_text.lines().next().unwrap_or("");
                format!(
                    "{} slide {}: {}",
                    presentation_name, slide_index, first_line
                )
            }
            EventPayload::FadeToBlack { me_number } => format!("ME{} fade to black", me_number),
            EventPayload::RecordStart { device, timecode, .. } => format!(
                "{} recording started{}",
                device,
                timecode.as_deref().map(|t| format!(" at {}", t)).unwrap_or_default()
            ),
            EventPayload::RecordStop { device, timecode, .. } => format!(
                "{} recording stopped{}",
                device,
                timecode.as_deref().map(|t| format!(" at {}", t)).unwrap_or_default()
            ),
            EventPayload::ConnectionChange {
                service_name,
                connected,
                detail,
            } => {
                let verb = if *connected { "connected" } else { "disconnected" };
                if detail.is_empty() {
                    format!("{} {}", service_name, verb)
                } else {
                    format!("{} {} ({})", service_name, verb, detail)
                }
            }
            EventPayload::FileTransfer { file_name, detail } => {
                format!("transfer {}: {}", file_name, detail)
            }
        }
    }
}

/// An event as reported by a client, before it reaches the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EventDraft {
    /// Draft stamped with the current wall-clock time
    pub fn now(payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn at(timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Self { timestamp, payload }
    }

    pub fn connection(service_name: impl Into<String>, connected: bool, detail: impl Into<String>) -> Self {
        Self::now(EventPayload::ConnectionChange {
            service_name: service_name.into(),
            connected,
            detail: detail.into(),
        })
    }
}

/// An immutable, logged production event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    /// `HH:MM:SS:FF` relative to the session start
    pub timecode: String,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl ProductionEvent {
    pub fn summary(&self) -> String {
        self.payload.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kind() {
        let p = EventPayload::KeyerOn {
            me_number: 1,
            keyer_number: 2,
        };
        assert_eq!(p.kind(), EventKind::KeyerOn);
        assert!(p.kind().is_boundary());
        assert!(!EventKind::RecordStart.is_boundary());
        assert!(!EventKind::ConnectionChange.is_boundary());
    }

    #[test]
    fn test_summaries() {
        let cut = EventPayload::ProgramCut {
            source_index: 2,
            source_name: "CAM 2".to_string(),
            bus_name: "ME1PGM".to_string(),
        };
        assert_eq!(cut.summary(), "ME1PGM: cut to CAM 2 (2)");

        let slide = EventPayload::SlideChange {
            presentation_name: "Sunday".to_string(),
            slide_index: 4,
            slide_text: "Amazing grace\nhow sweet".to_string(),
        };
        assert_eq!(slide.summary(), "Sunday slide 4: Amazing grace");

        let conn = EventPayload::ConnectionChange {
            service_name: "deck".to_string(),
            connected: false,
            detail: String::new(),
        };
        assert_eq!(conn.summary(), "deck disconnected");
    }

    #[test]
    fn test_payload_serializes_with_tag() {
        let p = EventPayload::Transition {
            source_index: 3,
            source_name: "CAM 3".to_string(),
            bus_name: "ME1PGM".to_string(),
            transition_kind: TransitionKind::Auto,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["type"], "Transition");
        assert_eq!(json["sourceIndex"], 3);
        assert_eq!(json["transitionKind"], "Auto");

        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, p);
    }
}
