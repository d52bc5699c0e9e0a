//! Application configuration
//!
//! Service endpoints, timeline format, track list and routing, stored as
//! JSON at `<data_dir>/touchdrive/config.json`. Every field has a default so
//! partial files load.

use crate::events::{EventKind, EventPayload};
use crate::protocol::{deck, rosstalk, tally, ServiceId};
use crate::timecode::{Timecode, TimecodeFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration problems found by [`AppConfig::try_load`] or [`AppConfig::validate`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_tally_port() -> u16 {
    tally::DEFAULT_PORT
}

fn default_rosstalk_port() -> u16 {
    rosstalk::DEFAULT_PORT
}

fn default_deck_port() -> u16 {
    deck::DEFAULT_PORT
}

fn default_command_timeout_ms() -> u64 {
    deck::DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

fn default_presentation_port() -> u16 {
    1025
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

/// Tally listener: the switcher connects to us
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local address to bind
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_tally_port")]
    pub port: u16,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_listen_host(),
            port: default_tally_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RossTalkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_rosstalk_port")]
    pub port: u16,
}

impl Default for RossTalkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_rosstalk_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_deck_port")]
    pub port: u16,
    /// How long to wait for a command reply
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_deck_port(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// One ProPresenter machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationConfig {
    /// Stable id, used in `presentation:<id>` service ids
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_presentation_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub fetch_thumbnails: bool,
}

impl PresentationConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port,
            enabled: true,
            fetch_thumbnails: false,
        }
    }

    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, self.port)
        } else {
            format!("http://{}:{}", host, self.port)
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A timeline track as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineTrackConfig {
    pub id: String,
    pub label: String,
    /// CSS-style color, e.g. `#e53935`
    #[serde(default)]
    pub color: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub order: u32,
}

impl TimelineTrackConfig {
    pub fn new(id: &str, label: &str, color: &str, order: u32) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            color: color.to_string(),
            is_enabled: true,
            order,
        }
    }
}

/// Routes boundary events to a track
///
/// An event matches when its kind is listed and, if set, its bus or
/// presentation name equals the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRule {
    pub track: String,
    pub kinds: Vec<EventKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_name: Option<String>,
}

impl TrackRule {
    pub fn new(track: &str, kinds: &[EventKind]) -> Self {
        Self {
            track: track.to_string(),
            kinds: kinds.to_vec(),
            bus_name: None,
            presentation_name: None,
        }
    }

    pub fn matches(&self, payload: &EventPayload) -> bool {
        if !self.kinds.contains(&payload.kind()) {
            return false;
        }
        let bus_ok = match (&self.bus_name, payload) {
            (None, _) => true,
            (Some(want), EventPayload::ProgramCut { bus_name, .. })
            | (Some(want), EventPayload::Transition { bus_name, .. }) => want == bus_name,
            (Some(_), _) => false,
        };
        let presentation_ok = match (&self.presentation_name, payload) {
            (None, _) => true,
            (
                Some(want),
                EventPayload::SlideChange {
                    presentation_name, ..
                },
            ) => want == presentation_name,
            (Some(_), _) => false,
        };
        bus_ok && presentation_ok
    }
}

fn default_frame_rate() -> f64 {
    29.97
}

fn default_start_timecode() -> String {
    Timecode::ZERO.to_string()
}

fn default_tracks() -> Vec<TimelineTrackConfig> {
    vec![
        TimelineTrackConfig::new("program", "Program", "#e53935", 0),
        TimelineTrackConfig::new("keyers", "Keyers", "#fb8c00", 1),
        TimelineTrackConfig::new("slides", "Slides", "#1e88e5", 2),
    ]
}

fn default_routing() -> Vec<TrackRule> {
    vec![
        TrackRule::new(
            "program",
            &[
                EventKind::ProgramCut,
                EventKind::Transition,
                EventKind::FadeToBlack,
            ],
        ),
        TrackRule::new("keyers", &[EventKind::KeyerOn, EventKind::KeyerOff]),
        TrackRule::new("slides", &[EventKind::SlideChange]),
    ]
}

/// Timeline format, tracks and routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default = "default_true")]
    pub drop_frame: bool,
    /// Timecode of the session's first frame
    #[serde(default = "default_start_timecode")]
    pub start_timecode: String,
    #[serde(default = "default_tracks")]
    pub tracks: Vec<TimelineTrackConfig>,
    #[serde(default = "default_routing")]
    pub routing: Vec<TrackRule>,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            frame_rate: default_frame_rate(),
            drop_frame: true,
            start_timecode: default_start_timecode(),
            tracks: default_tracks(),
            routing: default_routing(),
        }
    }
}

impl TimelineConfig {
    pub fn format(&self) -> Result<TimecodeFormat, ConfigError> {
        TimecodeFormat::new(self.frame_rate, self.drop_frame)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Start offset in frames
    pub fn start_offset(&self) -> Result<u64, ConfigError> {
        let format = self.format()?;
        let tc: Timecode = self
            .start_timecode
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("start_timecode: {}", e)))?;
        format
            .to_frames(&tc)
            .map_err(|e| ConfigError::Invalid(format!("start_timecode: {}", e)))
    }

    /// Enabled tracks sorted by `order`
    pub fn enabled_tracks(&self) -> Vec<TimelineTrackConfig> {
        let mut tracks: Vec<_> = self.tracks.iter().filter(|t| t.is_enabled).cloned().collect();
        tracks.sort_by_key(|t| t.order);
        tracks
    }
}

fn default_server_port() -> u16 {
    8930
}

/// Web control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen_host")]
    pub bind_addr: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_listen_host(),
            port: default_server_port(),
        }
    }
}

fn default_event_display_limit() -> usize {
    500
}

/// Persistent application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub tally: TallyConfig,
    #[serde(default)]
    pub rosstalk: RossTalkConfig,
    #[serde(default)]
    pub deck: DeckConfig,
    #[serde(default)]
    pub presentations: Vec<PresentationConfig>,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub server: ServerSettings,
    /// Open and close sessions when the deck starts and stops recording
    #[serde(default)]
    pub follow_deck_recording: bool,
    /// How many events the CLI and web surface show
    #[serde(default = "default_event_display_limit")]
    pub event_display_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tally: TallyConfig::default(),
            rosstalk: RossTalkConfig::default(),
            deck: DeckConfig::default(),
            presentations: Vec::new(),
            timeline: TimelineConfig::default(),
            server: ServerSettings::default(),
            follow_deck_recording: false,
            event_display_limit: default_event_display_limit(),
        }
    }
}

impl AppConfig {
    /// Config file path: `<data_dir>/touchdrive/config.json`
    pub fn path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("touchdrive")
            .join("config.json")
    }

    /// Read and parse a config file
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load config from `path`, falling back to defaults on any error
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "Loaded config from disk");
                config
            }
            Err(ConfigError::Io { .. }) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, using defaults");
                Self::default()
            }
        }
    }

    /// Load from the default location
    pub fn load_default() -> Self {
        Self::load(&Self::path())
    }

    /// Save config to disk, creating parent directories if needed
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Config saved to disk");
        Ok(())
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeline.start_offset()?;

        let mut track_ids = HashSet::new();
        for track in &self.timeline.tracks {
            if track.id.trim().is_empty() {
                return Err(ConfigError::Invalid("track with empty id".to_string()));
            }
            if !track_ids.insert(track.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate track id {}", track.id)));
            }
        }
        for rule in &self.timeline.routing {
            if !track_ids.contains(rule.track.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "routing refers to unknown track {}",
                    rule.track
                )));
            }
        }

        let mut presentation_ids = HashSet::new();
        for p in &self.presentations {
            if p.id.trim().is_empty() || p.id.contains(':') {
                return Err(ConfigError::Invalid(format!("bad presentation id {:?}", p.id)));
            }
            if !presentation_ids.insert(p.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate presentation id {}",
                    p.id
                )));
            }
        }
        Ok(())
    }

    /// Services that `connect_all` should bring up
    pub fn enabled_services(&self) -> Vec<ServiceId> {
        let mut services = Vec::new();
        if self.tally.enabled {
            services.push(ServiceId::Tally);
        }
        if self.rosstalk.enabled {
            services.push(ServiceId::RossTalk);
        }
        if self.deck.enabled {
            services.push(ServiceId::Deck);
        }
        services.extend(
            self.presentations
                .iter()
                .filter(|p| p.enabled)
                .map(|p| ServiceId::Presentation(p.id.clone())),
        );
        services
    }

    pub fn presentation(&self, id: &str) -> Option<&PresentationConfig> {
        self.presentations.iter().find(|p| p.id == id)
    }
}
