//! ProPresenter API payloads and slide tracking
//!
//! The presentation API streams updates when a request carries
//! `?chunked=true`: the body stays open and every update is one JSON
//! document followed by `\r\n\r\n`.

use crate::error::DecodeError;
use crate::events::EventPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const CHUNK_DELIMITER: &[u8] = b"\r\n\r\n";

/// Splits a chunked response body into JSON documents
#[derive(Debug, Default)]
pub struct ChunkSplitter {
    buffer: Vec<u8>,
}

impl ChunkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append body bytes and return every completed document
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, DecodeError>> {
        self.buffer.extend_from_slice(bytes);
        let mut documents = Vec::new();

        while let Some(pos) = self
            .buffer
            .windows(CHUNK_DELIMITER.len())
            .position(|w| w == CHUNK_DELIMITER)
        {
            let chunk: Vec<u8> = self.buffer.drain(..pos + CHUNK_DELIMITER.len()).collect();
            let body = &chunk[..pos];
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            documents.push(
                String::from_utf8(body.to_vec()).map_err(|_| DecodeError::InvalidText("chunk")),
            );
        }
        documents
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn json_error(e: serde_json::Error) -> DecodeError {
    DecodeError::MalformedField {
        field: "json",
        value: e.to_string(),
    }
}

/// `GET /version`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub host_description: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlideIndexBody {
    presentation_index: Option<PresentationIndex>,
}

#[derive(Debug, Deserialize)]
struct PresentationIndex {
    index: u32,
    presentation_id: PresentationId,
}

#[derive(Debug, Deserialize)]
struct PresentationId {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    name: String,
}

/// Where the operator currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidePosition {
    pub presentation_uuid: String,
    pub presentation_name: String,
    pub slide_index: u32,
}

/// Parse a `/v1/presentation/slide_index` document
///
/// # Returns
/// `None` when no presentation is active
pub fn parse_slide_index(json: &str) -> Result<Option<SlidePosition>, DecodeError> {
    let body: SlideIndexBody = serde_json::from_str(json).map_err(json_error)?;
    Ok(body.presentation_index.map(|p| SlidePosition {
        presentation_uuid: p.presentation_id.uuid,
        presentation_name: p.presentation_id.name,
        slide_index: p.index,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusSlideBody {
    current: Option<SlideText>,
}

#[derive(Debug, Deserialize)]
struct SlideText {
    #[serde(default)]
    text: String,
}

/// Parse a `/v1/status/slide` document into the current slide's text
pub fn parse_slide_text(json: &str) -> Result<String, DecodeError> {
    let body: StatusSlideBody = serde_json::from_str(json).map_err(json_error)?;
    Ok(body.current.map(|c| c.text).unwrap_or_default())
}

/// Last known presentation state of one machine
#[derive(Debug, Clone, Default, Serialize)]
pub struct PresentationState {
    pub presentation_name: Option<String>,
    pub presentation_uuid: Option<String>,
    pub slide_index: Option<u32>,
    pub slide_text: Option<String>,
    /// Opaque image bytes; never inspected
    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PresentationState {
    /// Merge a new position and text
    ///
    /// # Returns
    /// `SlideChange` when the slide index or text differs from before
    pub fn update(&mut self, position: &SlidePosition, text: String) -> Option<EventPayload> {
        let changed = self.slide_index != Some(position.slide_index)
            || self.slide_text.as_deref() != Some(text.as_str());

        self.presentation_name = Some(position.presentation_name.clone());
        self.presentation_uuid = Some(position.presentation_uuid.clone());
        self.updated_at = Some(Utc::now());
        if !changed {
            return None;
        }

        self.slide_index = Some(position.slide_index);
        self.slide_text = Some(text.clone());
        self.thumbnail = None;
        Some(EventPayload::SlideChange {
            presentation_name: position.presentation_name.clone(),
            slide_index: position.slide_index,
            slide_text: text,
        })
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumbnail.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLIDE_INDEX: &str = r#"{"presentation_index":{"index":4,"presentation_id":{"uuid":"A1","name":"Sunday","index":0}}}"#;

    #[test]
    fn test_splitter_handles_split_delimiters() {
        let mut splitter = ChunkSplitter::new();
        assert!(splitter.push(b"{\"a\":1}\r\n").is_empty());
        let docs = splitter.push(b"\r\n{\"a\":2}\r\n\r\n{\"a\"");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].as_deref(), Ok("{\"a\":1}"));
        assert_eq!(docs[1].as_deref(), Ok("{\"a\":2}"));
        assert_eq!(splitter.buffered(), 4);
    }

    #[test]
    fn test_splitter_skips_keepalives() {
        let mut splitter = ChunkSplitter::new();
        assert!(splitter.push(b"\r\n\r\n").is_empty());
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_parse_slide_index() {
        let pos = parse_slide_index(SLIDE_INDEX).unwrap().unwrap();
        assert_eq!(pos.slide_index, 4);
        assert_eq!(pos.presentation_name, "Sunday");
        assert_eq!(pos.presentation_uuid, "A1");

        assert!(parse_slide_index(r#"{"presentation_index":null}"#)
            .unwrap()
            .is_none());
        assert!(parse_slide_index("not json").is_err());
    }

    #[test]
    fn test_parse_slide_text() {
        let json = r#"{"current":{"text":"Amazing grace","notes":"","uuid":"x"},"next":{"text":"How sweet"}}"#;
        assert_eq!(parse_slide_text(json).unwrap(), "Amazing grace");
        assert_eq!(parse_slide_text(r#"{"current":null}"#).unwrap(), "");
    }

    #[test]
    fn test_update_emits_once_per_slide() {
        let mut state = PresentationState::default();
        let pos = parse_slide_index(SLIDE_INDEX).unwrap().unwrap();

        let first = state.update(&pos, "Verse 1".to_string());
        assert!(matches!(
            first,
            Some(EventPayload::SlideChange { slide_index: 4, .. })
        ));
        assert!(state.update(&pos, "Verse 1".to_string()).is_none());

        // Same index, edited text
        assert!(state.update(&pos, "Verse 1 (edited)".to_string()).is_some());

        let next = SlidePosition {
            slide_index: 5,
            ..pos
        };
        assert!(state.update(&next, "Verse 1 (edited)".to_string()).is_some());
        assert_eq!(state.slide_index, Some(5));
    }
}
