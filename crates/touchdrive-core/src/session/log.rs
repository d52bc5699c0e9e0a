//! Append-only event log

use crate::events::{EventId, EventPayload, ProductionEvent};
use chrono::{DateTime, Utc};

/// Ordered, in-memory log of production events
///
/// Ids are assigned on append and keep increasing across [`EventLog::clear`],
/// so a range of ids always denotes the same events.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<ProductionEvent>,
    next_id: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next id
    pub fn append(
        &mut self,
        timestamp: DateTime<Utc>,
        timecode: String,
        payload: EventPayload,
    ) -> ProductionEvent {
        let event = ProductionEvent {
            id: EventId(self.next_id),
            timestamp,
            timecode,
            kind: payload.kind(),
            payload,
        };
        self.next_id += 1;
        self.events.push(event.clone());
        event
    }

    /// Id the next appended event will get
    pub fn next_id(&self) -> EventId {
        EventId(self.next_id)
    }

    pub fn events(&self) -> &[ProductionEvent] {
        &self.events
    }

    /// The newest `n` events, oldest first
    pub fn last_n(&self, n: usize) -> &[ProductionEvent] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    /// Events with ids in `[from, to)`; `to = None` means up to the end
    pub fn range(&self, from: EventId, to: Option<EventId>) -> &[ProductionEvent] {
        let start = self.events.partition_point(|e| e.id < from);
        let end = match to {
            Some(to) => self.events.partition_point(|e| e.id < to),
            None => self.events.len(),
        };
        &self.events[start..end.max(start)]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop every event, returning how many were removed
    pub fn clear(&mut self) -> usize {
        let removed = self.events.len();
        self.events.clear();
        removed
    }
}
