//! Protocol clients
//!
//! One client per external protocol, each owning its transport and its
//! private parse/diff state:
//! - TSL UMD 5.0 tally listener ([`tally`], decoding in [`tsl`])
//! - RossTalk switcher commands ([`rosstalk`])
//! - HyperDeck deck control ([`deck`], parsing in [`hyperdeck`])
//! - ProPresenter presentation API ([`presentation`], parsing in [`propresenter`])
//!
//! Clients report through an [`EventSink`] handed to them by the supervisor
//! and expose their connectivity through a shared [`ClientStatus`].

pub mod deck;
pub mod hyperdeck;
pub mod presentation;
pub mod propresenter;
pub mod rosstalk;
pub mod tally;
pub mod tsl;

use crate::events::EventDraft;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Channel every client pushes its events into
pub type EventSink = mpsc::UnboundedSender<EventDraft>;

/// How long `disconnect()` waits for a receive loop before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Identifies one supervised service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ServiceId {
    Tally,
    RossTalk,
    Deck,
    Presentation(String),
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Tally => write!(f, "tally"),
            ServiceId::RossTalk => write!(f, "rosstalk"),
            ServiceId::Deck => write!(f, "deck"),
            ServiceId::Presentation(id) => write!(f, "presentation:{}", id),
        }
    }
}

impl FromStr for ServiceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tally" => Ok(ServiceId::Tally),
            "rosstalk" => Ok(ServiceId::RossTalk),
            "deck" => Ok(ServiceId::Deck),
            other => match other.strip_prefix("presentation:") {
                Some(id) if !id.is_empty() => Ok(ServiceId::Presentation(id.to_string())),
                _ => Err(format!("Unknown service: {}", s)),
            },
        }
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ServiceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Connection lifecycle of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected and not trying
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected (or listening, for the tally listener)
    Connected,
    /// Last attempt failed; `last_error` says why. Retry is caller-driven.
    Failed,
}

/// Connectivity snapshot of one client
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            connected_since: None,
        }
    }
}

/// Status cell shared between a client's loop (writer) and observers (readers)
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusCell(Arc<Mutex<ClientStatus>>);

impl StatusCell {
    pub(crate) fn snapshot(&self) -> ClientStatus {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut ClientStatus)) {
        if let Ok(mut status) = self.0.lock() {
            f(&mut status);
        }
    }

    pub(crate) fn set_connecting(&self) {
        self.update(|s| s.state = ConnectionState::Connecting);
    }

    pub(crate) fn set_connected(&self) {
        self.update(|s| {
            s.state = ConnectionState::Connected;
            s.connected_since = Some(Utc::now());
        });
    }

    pub(crate) fn set_disconnected(&self) {
        self.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.connected_since = None;
        });
    }

    /// Record a failure that ended the connection
    pub(crate) fn set_failed(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| {
            s.state = ConnectionState::Failed;
            s.connected_since = None;
            s.last_error = Some(error);
        });
    }

    /// Record a non-fatal error; connection state is left alone
    pub(crate) fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| s.last_error = Some(error));
    }
}

/// Push a draft into the sink; a closed sink only means nobody listens anymore
pub(crate) fn emit(sink: &EventSink, draft: EventDraft) {
    if sink.send(draft).is_err() {
        tracing::debug!("Event sink closed, dropping event");
    }
}

/// A spawned receive loop plus the signal that stops it
pub(crate) struct ClientTask {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ClientTask {
    /// Spawn `body`, handing it the shutdown receiver
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        Self {
            shutdown: Some(tx),
            handle: tokio::spawn(body(rx)),
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to release its socket
    pub(crate) async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.handle)
            .await
            .is_err()
        {
            tracing::warn!("Client loop did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Resolve `host:port` into a socket address string, rejecting empty hosts
pub(crate) fn socket_addr(host: &str, port: u16) -> Result<String, crate::error::TransportError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(crate::error::TransportError::InvalidAddress {
            addr: format!(":{}", port),
            reason: "empty host".to_string(),
        });
    }
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{}]:{}", host, port))
    } else {
        Ok(format!("{}:{}", host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_round_trip() {
        for id in [
            ServiceId::Tally,
            ServiceId::RossTalk,
            ServiceId::Deck,
            ServiceId::Presentation("front".to_string()),
        ] {
            let parsed: ServiceId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert!("presentation:".parse::<ServiceId>().is_err());
        assert!("mixer".parse::<ServiceId>().is_err());
    }

    #[test]
    fn test_status_cell_transitions() {
        let cell = StatusCell::default();
        assert_eq!(cell.snapshot().state, ConnectionState::Disconnected);

        cell.set_connected();
        assert!(cell.snapshot().is_connected());
        assert!(cell.snapshot().connected_since.is_some());

        cell.record_error("bad frame");
        assert!(cell.snapshot().is_connected());
        assert_eq!(cell.snapshot().last_error.as_deref(), Some("bad frame"));

        cell.set_failed("refused");
        let s = cell.snapshot();
        assert_eq!(s.state, ConnectionState::Failed);
        assert_eq!(s.last_error.as_deref(), Some("refused"));
        assert!(s.connected_since.is_none());
    }

    #[test]
    fn test_socket_addr() {
        assert_eq!(socket_addr("127.0.0.1", 5201).unwrap(), "127.0.0.1:5201");
        assert_eq!(socket_addr("::1", 80).unwrap(), "[::1]:80");
        assert!(socket_addr("  ", 80).is_err());
    }

    #[tokio::test]
    async fn test_client_task_stops() {
        let task = ClientTask::spawn(|shutdown| async move {
            let _ = shutdown.await;
        });
        assert!(!task.is_finished());
        task.stop().await;
    }
}
