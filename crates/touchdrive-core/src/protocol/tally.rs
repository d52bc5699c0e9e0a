//! Tally listener
//!
//! The switcher connects to us and pushes TSL 5.0 packets. Every packet is
//! decoded into a new [`BusState`] snapshot and diffed against the previous
//! one; program changes become `ProgramCut` (first assignment on a bus) or
//! `Transition` events. Malformed packets are dropped and recorded, the
//! connection stays up.

use super::tsl::{decode_packet, BusState, TslFramer};
use super::{emit, socket_addr, ClientStatus, ClientTask, EventSink, StatusCell};
use crate::error::{DecodeError, TransportError};
use crate::events::{EventDraft, EventPayload, TransitionKind};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Service name used in connection events
pub const SERVICE_NAME: &str = "tally";

/// Default TSL listener port
pub const DEFAULT_PORT: u16 = 5201;

/// Decoded bus state plus diagnostics about the packet stream
#[derive(Debug, Clone, Default, Serialize)]
pub struct TallyDiagnostics {
    pub bus_state: BusState,
    /// Raw bytes of the most recent packet, valid or not
    pub last_raw_frame: Option<Vec<u8>>,
    pub last_decode_error: Option<String>,
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub peers: usize,
    /// Reader tasks still alive, finished ones included until reaped
    pub peer_tasks: usize,
}

/// Parse/diff state owned by the listener loop
#[derive(Debug, Default)]
pub struct TallyState {
    bus: BusState,
    last_raw: Option<Vec<u8>>,
}

impl TallyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus_state(&self) -> &BusState {
        &self.bus
    }

    pub fn last_raw_frame(&self) -> Option<&[u8]> {
        self.last_raw.as_deref()
    }

    /// Decode one packet and return the events its program changes produce.
    ///
    /// On error the bus state is left untouched.
    pub fn process(&mut self, raw: &[u8]) -> Result<Vec<EventPayload>, DecodeError> {
        self.last_raw = Some(raw.to_vec());
        let packet = decode_packet(raw)?;
        let (next, touched) = self.bus.apply(&packet);
        let changes = self.bus.program_changes(&next, &touched);
        self.bus = next;

        Ok(changes
            .into_iter()
            .map(|c| {
                if c.first_assignment {
                    EventPayload::ProgramCut {
                        source_index: c.source_index,
                        source_name: c.source_name,
                        bus_name: c.bus,
                    }
                } else {
                    EventPayload::Transition {
                        source_index: c.source_index,
                        source_name: c.source_name,
                        bus_name: c.bus,
                        transition_kind: TransitionKind::Unknown,
                    }
                }
            })
            .collect())
    }
}

enum PeerMessage {
    Frame(Vec<u8>),
    Malformed(DecodeError),
    Closed {
        peer: SocketAddr,
        error: Option<String>,
    },
}

/// TSL tally listener
pub struct TallyClient {
    sink: EventSink,
    status: StatusCell,
    diagnostics: Arc<Mutex<TallyDiagnostics>>,
    task: Option<ClientTask>,
    local_addr: Option<SocketAddr>,
}

impl TallyClient {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            status: StatusCell::default(),
            diagnostics: Arc::new(Mutex::new(TallyDiagnostics::default())),
            task: None,
            local_addr: None,
        }
    }

    /// Bind the listener and start accepting switcher connections
    ///
    /// # Returns
    /// The bound address (useful when `port` is 0)
    pub async fn start_listening(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<SocketAddr, TransportError> {
        self.stop_listening().await;
        self.status.set_connecting();

        let addr = match socket_addr(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                self.status.set_failed(e.to_string());
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(source) => {
                let err = TransportError::Bind { addr, source };
                tracing::warn!(error = %err, "Tally listener bind failed");
                self.status.set_failed(err.to_string());
                return Err(err);
            }
        };
        let local = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let sink = self.sink.clone();
        let status = self.status.clone();
        let diagnostics = Arc::clone(&self.diagnostics);
        self.task = Some(ClientTask::spawn(move |shutdown| {
            run_listener(listener, shutdown, sink, status, diagnostics)
        }));
        self.local_addr = Some(local);
        self.status.set_connected();

        tracing::info!(addr = %local, "Tally listener started");
        Ok(local)
    }

    /// Stop listening and drop every peer connection. Safe to call twice.
    pub async fn stop_listening(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
            tracing::info!("Tally listener stopped");
        }
        self.local_addr = None;
        if let Ok(mut diag) = self.diagnostics.lock() {
            diag.peers = 0;
        }
        if self.status.snapshot().state != super::ConnectionState::Failed {
            self.status.set_disconnected();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn status(&self) -> ClientStatus {
        self.status.snapshot()
    }

    pub fn bus_state(&self) -> BusState {
        self.diagnostics().bus_state
    }

    pub fn diagnostics(&self) -> TallyDiagnostics {
        self.diagnostics
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

async fn run_listener(
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
    sink: EventSink,
    status: StatusCell,
    diagnostics: Arc<Mutex<TallyDiagnostics>>,
) {
    let (frame_tx, mut frame_rx) = mpsc::channel::<PeerMessage>(64);
    let mut peers = JoinSet::new();
    let mut state = TallyState::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "Tally source connected");
                    if let Ok(mut diag) = diagnostics.lock() {
                        diag.peers += 1;
                    }
                    emit(&sink, EventDraft::connection(SERVICE_NAME, true, peer.to_string()));
                    peers.spawn(read_peer(stream, peer, frame_tx.clone()));
                    set_peer_tasks(&diagnostics, peers.len());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Tally accept failed");
                    status.record_error(format!("accept failed: {}", e));
                }
            },
            Some(joined) = peers.join_next(), if !peers.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "Tally reader task failed");
                }
                set_peer_tasks(&diagnostics, peers.len());
            }
            Some(msg) = frame_rx.recv() => match msg {
                PeerMessage::Frame(raw) => {
                    let result = state.process(&raw);
                    record_frame(&diagnostics, raw, state.bus_state(), result.as_ref().err());
                    match result {
                        Ok(events) => {
                            for payload in events {
                                tracing::debug!(event = %payload.summary(), "Tally change");
                                emit(&sink, EventDraft::now(payload));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Discarding malformed TSL packet");
                            status.record_error(e.to_string());
                        }
                    }
                }
                PeerMessage::Malformed(e) => {
                    if let Ok(mut diag) = diagnostics.lock() {
                        diag.frames_rejected += 1;
                        diag.last_decode_error = Some(e.to_string());
                    }
                    tracing::warn!(error = %e, "Discarding unframeable TSL data");
                    status.record_error(e.to_string());
                }
                PeerMessage::Closed { peer, error } => {
                    tracing::info!(%peer, ?error, "Tally source disconnected");
                    if let Ok(mut diag) = diagnostics.lock() {
                        diag.peers = diag.peers.saturating_sub(1);
                    }
                    if let Some(ref e) = error {
                        status.record_error(e.clone());
                    }
                    let detail = error.unwrap_or_else(|| peer.to_string());
                    emit(&sink, EventDraft::connection(SERVICE_NAME, false, detail));
                }
            },
        }
    }

    peers.shutdown().await;
    set_peer_tasks(&diagnostics, 0);
}

fn set_peer_tasks(diagnostics: &Mutex<TallyDiagnostics>, count: usize) {
    if let Ok(mut diag) = diagnostics.lock() {
        diag.peer_tasks = count;
    }
}

fn record_frame(
    diagnostics: &Mutex<TallyDiagnostics>,
    raw: Vec<u8>,
    bus: &BusState,
    error: Option<&DecodeError>,
) {
    let Ok(mut diag) = diagnostics.lock() else {
        return;
    };
    diag.last_raw_frame = Some(raw);
    match error {
        None => {
            diag.frames_decoded += 1;
            diag.bus_state = bus.clone();
        }
        Some(e) => {
            diag.frames_rejected += 1;
            diag.last_decode_error = Some(e.to_string());
        }
    }
}

async fn read_peer(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<PeerMessage>) {
    let mut framer = TslFramer::new();
    let mut buf = [0u8; 4096];

    let error = loop {
        match stream.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                tracing::trace!(%peer, bytes = n, "TSL data");
                framer.push(&buf[..n]);
                while let Some(result) = framer.next_packet() {
                    let msg = match result {
                        Ok(raw) => PeerMessage::Frame(raw),
                        Err(e) => PeerMessage::Malformed(e),
                    };
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => break Some(format!("{} read failed: {}", peer, e)),
        }
    };

    let _ = tx.send(PeerMessage::Closed { peer, error }).await;
}
