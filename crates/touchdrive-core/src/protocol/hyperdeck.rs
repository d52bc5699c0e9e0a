//! HyperDeck Ethernet protocol parsing
//!
//! The deck speaks a line-oriented protocol. Every response starts with a
//! status line `CODE text`; when the text ends with `:` a block of
//! `key: value` lines follows, terminated by an empty line.
//!
//! - `1xx` failures (`100 syntax error`, `102 unsupported`, ...)
//! - `200 ok` and `2xx` informational replies to commands
//! - `5xx` asynchronous notifications (`500 connection info`,
//!   `502 slot info`, `508 transport info`)

use crate::error::DecodeError;
use crate::events::EventPayload;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Response code of the connection banner
pub const CODE_CONNECTION_INFO: u16 = 500;
pub const CODE_SLOT_INFO: u16 = 202;
pub const CODE_CLIPS_INFO: u16 = 205;
pub const CODE_TRANSPORT_INFO: u16 = 208;
pub const CODE_ASYNC_SLOT_INFO: u16 = 502;
pub const CODE_ASYNC_TRANSPORT_INFO: u16 = 508;

/// One complete response or notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub text: String,
    /// Body lines split at the first `:`, in arrival order
    pub fields: Vec<(String, String)>,
}

impl Response {
    /// `1xx`
    pub fn is_failure(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// `5xx`, pushed by the device without a command
    pub fn is_async(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse the `CODE text` status line; returns whether a body follows
pub fn parse_status_line(line: &str) -> Result<(u16, String, bool), DecodeError> {
    let line = line.trim();
    let (code, text) = line.split_once(' ').unwrap_or((line, ""));
    let code: u16 = code.parse().map_err(|_| DecodeError::UnknownHeader(line.to_string()))?;
    if !(100..600).contains(&code) {
        return Err(DecodeError::UnknownHeader(line.to_string()));
    }
    match text.strip_suffix(':') {
        Some(text) => Ok((code, text.to_string(), true)),
        None => Ok((code, text.to_string(), false)),
    }
}

/// Reassembles responses from a stream of lines
#[derive(Debug, Default)]
pub struct ResponseReader {
    pending: Option<Response>,
}

impl ResponseReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator)
    ///
    /// # Returns
    /// The finished response when `line` completes one
    pub fn push_line(&mut self, line: &str) -> Result<Option<Response>, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(mut response) = self.pending.take() {
            if line.trim().is_empty() {
                return Ok(Some(response));
            }
            let (key, value) = line.split_once(':').unwrap_or((line, ""));
            response
                .fields
                .push((key.trim().to_string(), value.trim().to_string()));
            self.pending = Some(response);
            return Ok(None);
        }

        if line.trim().is_empty() {
            return Ok(None);
        }

        let (code, text, multiline) = parse_status_line(line)?;
        let response = Response {
            code,
            text,
            fields: Vec::new(),
        };
        if multiline {
            self.pending = Some(response);
            Ok(None)
        } else {
            Ok(Some(response))
        }
    }

    /// True while a multi-line block is open
    pub fn in_block(&self) -> bool {
        self.pending.is_some()
    }
}

/// Transport status as reported in `transport info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    Preview,
    Stopped,
    Play,
    Forward,
    Rewind,
    Record,
    Shuttle,
    Jog,
    Other(String),
}

impl TransportStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "preview" => TransportStatus::Preview,
            "stopped" => TransportStatus::Stopped,
            "play" => TransportStatus::Play,
            "forward" => TransportStatus::Forward,
            "rewind" => TransportStatus::Rewind,
            "record" => TransportStatus::Record,
            "shuttle" => TransportStatus::Shuttle,
            "jog" => TransportStatus::Jog,
            other => TransportStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStatus::Preview => write!(f, "preview"),
            TransportStatus::Stopped => write!(f, "stopped"),
            TransportStatus::Play => write!(f, "play"),
            TransportStatus::Forward => write!(f, "forward"),
            TransportStatus::Rewind => write!(f, "rewind"),
            TransportStatus::Record => write!(f, "record"),
            TransportStatus::Shuttle => write!(f, "shuttle"),
            TransportStatus::Jog => write!(f, "jog"),
            TransportStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A clip on the deck's media
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeckClip {
    pub id: u32,
    pub name: String,
    pub start_timecode: Option<String>,
    pub duration: Option<String>,
}

/// Parse a `clips get` body line value: `name.mov 00:00:00:00 00:01:00:00`
fn parse_clip(id: u32, value: &str) -> DeckClip {
    let mut parts: Vec<&str> = value.split_whitespace().collect();
    let looks_like_tc = |s: &&str| s.len() == 11 && s.matches(':').count() == 3;

    let duration = match parts.last() {
        Some(s) if looks_like_tc(s) && parts.len() >= 3 => parts.pop().map(str::to_string),
        _ => None,
    };
    let start_timecode = match parts.last() {
        Some(s) if looks_like_tc(s) && parts.len() >= 2 => parts.pop().map(str::to_string),
        _ => None,
    };

    DeckClip {
        id,
        name: parts.join(" "),
        start_timecode,
        duration,
    }
}

/// Media slot state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub status: String,
    pub volume_name: Option<String>,
    pub recording_time: Option<u64>,
}

/// Everything known about the deck, merged from responses and notifications
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeckState {
    pub model: Option<String>,
    pub protocol_version: Option<String>,
    pub transport: Option<TransportStatus>,
    pub timecode: Option<String>,
    pub clip_id: Option<u32>,
    pub slot_id: Option<u8>,
    pub clips: Vec<DeckClip>,
    pub slots: BTreeMap<u8, SlotInfo>,
}

impl DeckState {
    /// Name used in record events
    pub fn device_name(&self) -> String {
        self.model.clone().unwrap_or_else(|| "HyperDeck".to_string())
    }

    pub fn is_recording(&self) -> bool {
        self.transport == Some(TransportStatus::Record)
    }

    /// Merge a response into the state
    ///
    /// # Returns
    /// `RecordStart`/`RecordStop` when the transport status moved into or out
    /// of `record`. The first observed status is not a transition.
    pub fn apply(&mut self, response: &Response) -> Option<EventPayload> {
        match response.code {
            CODE_CONNECTION_INFO => {
                if let Some(model) = response.field("model") {
                    self.model = Some(model.to_string());
                }
                if let Some(version) = response.field("protocol version") {
                    self.protocol_version = Some(version.to_string());
                }
                None
            }
            CODE_TRANSPORT_INFO | CODE_ASYNC_TRANSPORT_INFO => self.apply_transport(response),
            CODE_SLOT_INFO | CODE_ASYNC_SLOT_INFO => {
                self.apply_slot(response);
                None
            }
            CODE_CLIPS_INFO => {
                self.clips = response
                    .fields
                    .iter()
                    .filter_map(|(k, v)| k.parse::<u32>().ok().map(|id| parse_clip(id, v)))
                    .collect();
                None
            }
            _ => None,
        }
    }

    fn apply_transport(&mut self, response: &Response) -> Option<EventPayload> {
        // Notifications only carry the fields that changed
        if let Some(tc) = response
            .field("display timecode")
            .or_else(|| response.field("timecode"))
        {
            self.timecode = Some(tc.to_string());
        }
        if let Some(id) = response.field("clip id").and_then(|v| v.parse().ok()) {
            self.clip_id = Some(id);
        }
        if let Some(id) = response.field("slot id").and_then(|v| v.parse().ok()) {
            self.slot_id = Some(id);
        }

        let status = TransportStatus::parse(response.field("status")?);
        let previous = self.transport.replace(status.clone());
        let was_recording = previous.as_ref()? == &TransportStatus::Record;
        let is_recording = status == TransportStatus::Record;

        match (was_recording, is_recording) {
            (false, true) => Some(EventPayload::RecordStart {
                device: self.device_name(),
                timecode: self.timecode.clone(),
                clip_id: self.clip_id,
            }),
            (true, false) => Some(EventPayload::RecordStop {
                device: self.device_name(),
                timecode: self.timecode.clone(),
                clip_id: self.clip_id,
            }),
            _ => None,
        }
    }

    fn apply_slot(&mut self, response: &Response) {
        let Some(id) = response.field("slot id").and_then(|v| v.parse().ok()) else {
            return;
        };
        let slot = self.slots.entry(id).or_default();
        if let Some(status) = response.field("status") {
            slot.status = status.to_string();
        }
        if let Some(name) = response.field("volume name") {
            slot.volume_name = Some(name.to_string());
        }
        if let Some(time) = response.field("recording time").and_then(|v| v.parse().ok()) {
            slot.recording_time = Some(time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(reader: &mut ResponseReader, text: &str) -> Vec<Response> {
        text.split('\n')
            .filter_map(|line| reader.push_line(line).unwrap())
            .collect()
    }

    #[test]
    fn test_single_line_responses() {
        let mut reader = ResponseReader::new();
        let responses = feed(&mut reader, "200 ok\r\n100 syntax error\r\n");
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].code, 200);
        assert!(!responses[0].is_failure());
        assert_eq!(responses[1].text, "syntax error");
        assert!(responses[1].is_failure());
    }

    #[test]
    fn test_multi_line_block() {
        let mut reader = ResponseReader::new();
        let responses = feed(
            &mut reader,
            "500 connection info:\r\nprotocol version: 1.11\r\nmodel: HyperDeck Studio Mini\r\n\r\n",
        );
        assert_eq!(responses.len(), 1);
        let banner = &responses[0];
        assert!(banner.is_async());
        assert_eq!(banner.field("model"), Some("HyperDeck Studio Mini"));
        assert_eq!(banner.field("protocol version"), Some("1.11"));
        assert!(!reader.in_block());
    }

    #[test]
    fn test_block_waits_for_blank_line() {
        let mut reader = ResponseReader::new();
        assert!(reader.push_line("208 transport info:").unwrap().is_none());
        assert!(reader.push_line("status: record").unwrap().is_none());
        assert!(reader.in_block());
        let done = reader.push_line("").unwrap().unwrap();
        assert_eq!(done.field("status"), Some("record"));
    }

    #[test]
    fn test_bad_status_line() {
        let mut reader = ResponseReader::new();
        assert!(reader.push_line("hello there").is_err());
        assert!(reader.push_line("999 nope").is_err());
        // Reader recovers
        assert_eq!(reader.push_line("200 ok").unwrap().unwrap().code, 200);
    }

    fn transport(code: u16, status: &str) -> Response {
        Response {
            code,
            text: "transport info".to_string(),
            fields: vec![
                ("status".to_string(), status.to_string()),
                ("display timecode".to_string(), "01:00:00:00".to_string()),
                ("clip id".to_string(), "3".to_string()),
            ],
        }
    }

    #[test]
    fn test_record_events_on_status_transitions_only() {
        let mut state = DeckState::default();

        // First observation is not a transition
        assert!(state.apply(&transport(208, "stopped")).is_none());
        assert!(state.apply(&transport(508, "preview")).is_none());

        match state.apply(&transport(508, "record")) {
            Some(EventPayload::RecordStart {
                timecode, clip_id, ..
            }) => {
                assert_eq!(timecode.as_deref(), Some("01:00:00:00"));
                assert_eq!(clip_id, Some(3));
            }
            other => panic!("expected RecordStart, got {:?}", other),
        }
        assert!(state.is_recording());

        // Still recording: no duplicate
        assert!(state.apply(&transport(508, "record")).is_none());
        assert!(matches!(
            state.apply(&transport(508, "stopped")),
            Some(EventPayload::RecordStop { .. })
        ));
    }

    #[test]
    fn test_notification_without_status_keeps_transport() {
        let mut state = DeckState::default();
        state.apply(&transport(208, "play"));
        let partial = Response {
            code: 508,
            text: "transport info".to_string(),
            fields: vec![("display timecode".to_string(), "00:00:10:00".to_string())],
        };
        assert!(state.apply(&partial).is_none());
        assert_eq!(state.transport, Some(TransportStatus::Play));
        assert_eq!(state.timecode.as_deref(), Some("00:00:10:00"));
    }

    #[test]
    fn test_clips_and_slots() {
        let mut state = DeckState::default();
        let clips = Response {
            code: 205,
            text: "clips info".to_string(),
            fields: vec![
                ("clip count".to_string(), "2".to_string()),
                (
                    "1".to_string(),
                    "Service Main.mov 00:00:00:00 00:45:12:10".to_string(),
                ),
                ("2".to_string(), "b-roll.mov".to_string()),
            ],
        };
        state.apply(&clips);
        assert_eq!(state.clips.len(), 2);
        assert_eq!(state.clips[0].name, "Service Main.mov");
        assert_eq!(state.clips[0].duration.as_deref(), Some("00:45:12:10"));
        assert_eq!(state.clips[1].start_timecode, None);

        let slot = Response {
            code: 502,
            text: "slot info".to_string(),
            fields: vec![
                ("slot id".to_string(), "1".to_string()),
                ("status".to_string(), "mounted".to_string()),
                ("recording time".to_string(), "3600".to_string()),
            ],
        };
        state.apply(&slot);
        assert_eq!(state.slots[&1].status, "mounted");
        assert_eq!(state.slots[&1].recording_time, Some(3600));
    }

    #[test]
    fn test_transport_status_parse() {
        assert_eq!(TransportStatus::parse("Record"), TransportStatus::Record);
        assert_eq!(
            TransportStatus::parse("fast"),
            TransportStatus::Other("fast".to_string())
        );
        assert_eq!(TransportStatus::Shuttle.to_string(), "shuttle");
    }
}
