//! HyperDeck deck-control client
//!
//! Commands are queued to the connection task, which writes them and pairs
//! each non-async response with the oldest outstanding command. The deck
//! answers in order, so a reply to a command that already timed out is
//! consumed and dropped without shifting the queue.

use super::hyperdeck::{DeckState, Response, ResponseReader};
use super::{emit, socket_addr, ClientStatus, ClientTask, EventSink, StatusCell};
use crate::error::{CommandError, TransportError};
use crate::events::EventDraft;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Service name used in connection events
pub const SERVICE_NAME: &str = "deck";

/// Default HyperDeck control port
pub const DEFAULT_PORT: u16 = 9993;

/// Default time to wait for a command reply
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = oneshot::Sender<Result<Response, CommandError>>;

struct QueuedCommand {
    line: String,
    reply: Reply,
}

/// HyperDeck TCP client
pub struct DeckClient {
    sink: EventSink,
    status: StatusCell,
    state: Arc<Mutex<DeckState>>,
    commands: Option<mpsc::Sender<QueuedCommand>>,
    task: Option<ClientTask>,
    command_timeout: Duration,
}

impl DeckClient {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            status: StatusCell::default(),
            state: Arc::new(Mutex::new(DeckState::default())),
            commands: None,
            task: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Connect to the deck and subscribe to transport and slot notifications
    ///
    /// # Arguments
    /// * `host` - Deck host name or address
    /// * `port` - Control port, normally [`DEFAULT_PORT`]
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.disconnect().await;
        self.status.set_connecting();

        let connected = async {
            let addr = socket_addr(host, port)?;
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Ok((addr, stream)),
                Ok(Err(source)) => Err(TransportError::Connect { addr, source }),
                Err(_) => Err(TransportError::ConnectTimeout { addr }),
            }
        }
        .await;

        let (addr, stream) = match connected {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(error = %e, "Deck connect failed");
                self.status.set_failed(e.to_string());
                return Err(e);
            }
        };

        if let Ok(mut state) = self.state.lock() {
            *state = DeckState::default();
        }

        // Marked connected before the reader runs, so a peer that hangs up
        // at once leaves the client Failed rather than Connected
        tracing::info!(%addr, "Deck connected");
        self.status.set_connected();
        emit(&self.sink, EventDraft::connection(SERVICE_NAME, true, addr.clone()));

        let (tx, rx) = mpsc::channel(16);
        let sink = self.sink.clone();
        let status = self.status.clone();
        let state = self.state.clone();
        self.task = Some(ClientTask::spawn(move |shutdown| {
            run_connection(stream, addr, rx, shutdown, sink, status, state)
        }));
        self.commands = Some(tx);

        // Without notifications the deck state only updates on demand
        for command in ["notify: transport: true slot: true", "transport info", "slot info"] {
            if let Err(e) = self.send_command(command).await {
                tracing::warn!(error = %e, command, "Deck setup command failed");
                self.status.record_error(e.to_string());
            }
        }
        Ok(())
    }

    /// Close the connection. Safe to call when not connected.
    pub async fn disconnect(&mut self) {
        self.commands = None;
        if let Some(task) = self.task.take() {
            let was_running = !task.is_finished();
            task.stop().await;
            self.status.set_disconnected();
            if was_running {
                emit(
                    &self.sink,
                    EventDraft::connection(SERVICE_NAME, false, "disconnected"),
                );
            }
        }
    }

    /// Send one command line and wait for its reply
    ///
    /// # Returns
    /// The deck's response, or `CommandError` when not connected, rejected
    /// with a `1xx` code, or unanswered within the command timeout
    pub async fn send_command(&self, command: &str) -> Result<Response, CommandError> {
        let commands = match &self.commands {
            Some(tx) if self.status.snapshot().is_connected() => tx,
            _ => return Err(CommandError::NotConnected),
        };

        let (reply, response) = oneshot::channel();
        commands
            .send(QueuedCommand {
                line: command.to_string(),
                reply,
            })
            .await
            .map_err(|_| CommandError::ConnectionLost(command.to_string()))?;

        match tokio::time::timeout(self.command_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::ConnectionLost(command.to_string())),
            Err(_) => Err(CommandError::Timeout(command.to_string())),
        }
    }

    /// Ask the deck to record. `RecordStart` follows from the transport
    /// notification, not from this call.
    pub async fn start_recording(&self) -> Result<(), CommandError> {
        self.send_command("record").await.map(|_| ())
    }

    pub async fn stop_recording(&self) -> Result<(), CommandError> {
        self.send_command("stop").await.map(|_| ())
    }

    /// Refresh the clip list
    pub async fn refresh_clips(&self) -> Result<(), CommandError> {
        self.send_command("clips get").await.map(|_| ())
    }

    pub fn status(&self) -> ClientStatus {
        self.status.snapshot()
    }

    pub fn state(&self) -> DeckState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn apply_response(state: &Mutex<DeckState>, response: &Response, sink: &EventSink) {
    let event = match state.lock() {
        Ok(mut state) => state.apply(response),
        Err(_) => return,
    };
    if let Some(payload) = event {
        tracing::info!(event = %payload.summary(), "Deck transport change");
        emit(sink, EventDraft::now(payload));
    }
}

async fn run_connection(
    stream: TcpStream,
    addr: String,
    mut commands: mpsc::Receiver<QueuedCommand>,
    mut shutdown: oneshot::Receiver<()>,
    sink: EventSink,
    status: StatusCell,
    state: Arc<Mutex<DeckState>>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut reader = ResponseReader::new();
    let mut pending: VecDeque<(String, Reply)> = VecDeque::new();

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => return,
            Some(command) = commands.recv() => {
                tracing::debug!(command = %command.line, "Deck <-");
                let line = format!("{}\r\n", command.line);
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    let _ = command.reply.send(Err(CommandError::ConnectionLost(command.line)));
                    break format!("{} write failed: {}", addr, e);
                }
                pending.push_back((command.line, command.reply));
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    tracing::trace!(%line, "Deck ->");
                    let response = match reader.push_line(&line) {
                        Ok(Some(response)) => response,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!(error = %e, "Undecodable deck response");
                            status.record_error(e.to_string());
                            continue;
                        }
                    };
                    apply_response(&state, &response, &sink);
                    if response.is_async() {
                        continue;
                    }
                    let Some((command, reply)) = pending.pop_front() else {
                        tracing::debug!(code = response.code, "Unsolicited deck response");
                        continue;
                    };
                    let result = if response.is_failure() {
                        Err(CommandError::Rejected {
                            command,
                            code: response.code,
                            message: response.text.clone(),
                        })
                    } else {
                        Ok(response)
                    };
                    let _ = reply.send(result);
                }
                Ok(None) => break format!("{} closed the connection", addr),
                Err(e) => break format!("{} read failed: {}", addr, e),
            },
        }
    };

    for (command, reply) in pending.drain(..) {
        let _ = reply.send(Err(CommandError::ConnectionLost(command)));
    }
    tracing::warn!(%reason, "Deck connection lost");
    status.set_failed(reason.clone());
    emit(&sink, EventDraft::connection(SERVICE_NAME, false, reason));
}
