//! Session state machine and event ingestion

use super::log::EventLog;
use crate::config::{ConfigError, TimelineConfig};
use crate::error::StateConflict;
use crate::events::{EventDraft, EventId, EventKind, ProductionEvent};
use crate::timecode::TimecodeFormat;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Capacity of the subscriber channel; slow subscribers see `Lagged`
const SUBSCRIBER_CAPACITY: usize = 1024;

/// One recording session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionSession {
    /// 1-based, in start order
    pub number: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// First event id that belongs to the session
    pub first_event: EventId,
    /// First event id after the session, once closed
    pub end_event: Option<EventId>,
}

impl ProductionSession {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn contains(&self, id: EventId) -> bool {
        id >= self.first_event && self.end_event.map_or(true, |end| id < end)
    }
}

/// Recording state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state")]
pub enum SessionState {
    Idle,
    Recording { session: ProductionSession },
}

/// Point-in-time copy of what the timeline needs
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub events: Vec<ProductionEvent>,
    /// The open session, or else the most recently closed one
    pub session: Option<ProductionSession>,
    pub format: TimecodeFormat,
    pub start_offset: u64,
}

struct Inner {
    log: EventLog,
    state: SessionState,
    history: Vec<ProductionSession>,
    format: TimecodeFormat,
    start_offset: u64,
}

impl Inner {
    fn timecode_for(&self, timestamp: DateTime<Utc>) -> String {
        let elapsed = match &self.state {
            SessionState::Recording { session } => {
                self.format.frames_for_duration(timestamp - session.start_time)
            }
            SessionState::Idle => 0,
        };
        self.format
            .to_timecode(self.start_offset + elapsed)
            .to_string()
    }

    fn latest_session(&self) -> Option<ProductionSession> {
        match &self.state {
            SessionState::Recording { session } => Some(session.clone()),
            SessionState::Idle => self.history.last().cloned(),
        }
    }
}

/// Owner of the event log and the recording state
///
/// Cloning gives another handle to the same log.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Mutex<Inner>>,
    events_tx: broadcast::Sender<ProductionEvent>,
}

impl SessionManager {
    /// # Arguments
    /// * `format` - Frame rate and drop-frame mode for event timecodes
    /// * `start_offset` - Frame number of the session's first frame
    pub fn new(format: TimecodeFormat, start_offset: u64) -> Self {
        let (events_tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                log: EventLog::new(),
                state: SessionState::Idle,
                history: Vec::new(),
                format,
                start_offset,
            })),
            events_tx,
        }
    }

    pub fn from_config(config: &TimelineConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.format()?, config.start_offset()?))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the log consistent, so keep going
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a draft to the log and notify subscribers
    pub fn ingest(&self, draft: EventDraft) -> ProductionEvent {
        let mut inner = self.lock();
        let timecode = inner.timecode_for(draft.timestamp);
        let event = inner.log.append(draft.timestamp, timecode, draft.payload);
        tracing::debug!(id = %event.id, event = %event.summary(), "Event logged");
        // No subscribers is fine
        let _ = self.events_tx.send(event.clone());
        event
    }

    /// Open a recording session
    pub fn start_session(&self) -> Result<ProductionSession, StateConflict> {
        let mut inner = self.lock();
        if matches!(inner.state, SessionState::Recording { .. }) {
            return Err(StateConflict::AlreadyRecording);
        }
        let session = ProductionSession {
            number: inner.history.len() as u32 + 1,
            start_time: Utc::now(),
            end_time: None,
            first_event: inner.log.next_id(),
            end_event: None,
        };
        inner.state = SessionState::Recording {
            session: session.clone(),
        };
        tracing::info!(session = session.number, "Recording session started");
        Ok(session)
    }

    /// Close the open session
    pub fn stop_session(&self) -> Result<ProductionSession, StateConflict> {
        let mut inner = self.lock();
        let SessionState::Recording { mut session } =
            std::mem::replace(&mut inner.state, SessionState::Idle)
        else {
            return Err(StateConflict::NotRecording);
        };
        session.end_time = Some(Utc::now());
        session.end_event = Some(inner.log.next_id());
        inner.history.push(session.clone());
        tracing::info!(session = session.number, "Recording session stopped");
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.lock().state, SessionState::Recording { .. })
    }

    pub fn current_session(&self) -> Option<ProductionSession> {
        match &self.lock().state {
            SessionState::Recording { session } => Some(session.clone()),
            SessionState::Idle => None,
        }
    }

    /// Closed sessions, oldest first
    pub fn sessions(&self) -> Vec<ProductionSession> {
        self.lock().history.clone()
    }

    pub fn events(&self) -> Vec<ProductionEvent> {
        self.lock().log.events().to_vec()
    }

    /// The newest `n` events, oldest first
    pub fn recent(&self, n: usize) -> Vec<ProductionEvent> {
        self.lock().log.last_n(n).to_vec()
    }

    /// Events logged while `session` was open
    pub fn session_events(&self, session: &ProductionSession) -> Vec<ProductionEvent> {
        self.lock()
            .log
            .range(session.first_event, session.end_event)
            .to_vec()
    }

    pub fn event_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Empty the log. Refused while recording.
    pub fn clear_log(&self) -> Result<usize, StateConflict> {
        let mut inner = self.lock();
        if matches!(inner.state, SessionState::Recording { .. }) {
            return Err(StateConflict::ClearWhileRecording);
        }
        let removed = inner.log.clear();
        tracing::info!(removed, "Event log cleared");
        Ok(removed)
    }

    /// Receive every event appended from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ProductionEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> LogSnapshot {
        let inner = self.lock();
        LogSnapshot {
            events: inner.log.events().to_vec(),
            session: inner.latest_session(),
            format: inner.format,
            start_offset: inner.start_offset,
        }
    }

    /// Change the timecode format for events appended from now on
    pub fn set_timecode_format(&self, format: TimecodeFormat, start_offset: u64) {
        let mut inner = self.lock();
        inner.format = format;
        inner.start_offset = start_offset;
    }

    pub fn timecode_format(&self) -> (TimecodeFormat, u64) {
        let inner = self.lock();
        (inner.format, inner.start_offset)
    }

    /// Drain `events` into the log until every sender is gone
    ///
    /// With `follow_deck_recording`, a deck `RecordStart` opens a session
    /// before it is logged and a `RecordStop` closes it after.
    pub fn spawn_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<EventDraft>,
        follow_deck_recording: bool,
    ) -> JoinHandle<()> {
        let sessions = self.clone();
        tokio::spawn(async move {
            while let Some(draft) = events.recv().await {
                let kind = draft.payload.kind();
                if follow_deck_recording && kind == EventKind::RecordStart {
                    if let Err(e) = sessions.start_session() {
                        tracing::debug!(error = %e, "Deck started recording during a session");
                    }
                }
                sessions.ingest(draft);
                if follow_deck_recording && kind == EventKind::RecordStop {
                    if let Err(e) = sessions.stop_session() {
                        tracing::debug!(error = %e, "Deck stopped recording outside a session");
                    }
                }
            }
            tracing::debug!("Event pump finished");
        })
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(TimecodeFormat::default(), 0)
    }
}
