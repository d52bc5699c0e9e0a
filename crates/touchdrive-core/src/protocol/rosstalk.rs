//! RossTalk switcher client
//!
//! Connects to the switcher's RossTalk port and follows the CRLF-terminated
//! command stream it echoes: ME cuts/autos, program source selection, keyer
//! cuts/autos and fade to black. Commands that do not change production
//! state (crosspoints, salvos) are logged and ignored.

use super::{emit, socket_addr, ClientStatus, ClientTask, EventSink, StatusCell};
use crate::error::{DecodeError, TransportError};
use crate::events::{EventDraft, EventPayload, TransitionKind};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

/// Service name used in connection events
pub const SERVICE_NAME: &str = "rosstalk";

/// Default RossTalk port
pub const DEFAULT_PORT: u16 = 7788;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A parsed RossTalk command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RossTalkCommand {
    MeCut { me: u8 },
    MeAuto { me: u8 },
    Select { bus: String, me: u8, source: u16 },
    Keyer { me: u8, keyer: u8, on: bool, auto: bool },
    FadeToBlack { me: u8 },
    Crosspoint { level: String, destination: u16, source: u16 },
    Salvo(u32),
    Other(String),
}

fn parse_num<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, DecodeError> {
    value.trim().parse().map_err(|_| DecodeError::MalformedField {
        field,
        value: value.to_string(),
    })
}

/// Split `ME:1:2:OFF` style arguments after the `ME:` prefix
fn me_args(args: &str) -> Result<Vec<&str>, DecodeError> {
    args.trim()
        .strip_prefix("ME:")
        .map(|rest| rest.split(':').collect())
        .ok_or_else(|| DecodeError::MalformedField {
            field: "ME",
            value: args.to_string(),
        })
}

/// Parse one line of RossTalk
pub fn parse_command(line: &str) -> Result<RossTalkCommand, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::UnknownHeader(String::new()));
    }
    let (verb, args) = line.split_once(' ').unwrap_or((line, ""));

    match verb.to_ascii_uppercase().as_str() {
        "MECUT" | "MEAUTO" => {
            let parts = me_args(args)?;
            let me = parse_num("ME", parts[0])?;
            if verb.eq_ignore_ascii_case("MECUT") {
                Ok(RossTalkCommand::MeCut { me })
            } else {
                Ok(RossTalkCommand::MeAuto { me })
            }
        }
        "SELECT" => {
            let parts: Vec<&str> = args.trim().split(':').collect();
            match parts.as_slice() {
                [bus, me, input, source] if input.eq_ignore_ascii_case("IN") => {
                    Ok(RossTalkCommand::Select {
                        bus: bus.to_ascii_uppercase(),
                        me: parse_num("ME", me)?,
                        source: parse_num("source", source)?,
                    })
                }
                _ => Err(DecodeError::MalformedField {
                    field: "SELECT",
                    value: args.to_string(),
                }),
            }
        }
        "KEYCUT" | "KEYAUTO" => {
            let parts = me_args(args)?;
            if parts.len() < 2 {
                return Err(DecodeError::MalformedField {
                    field: "keyer",
                    value: args.to_string(),
                });
            }
            let on = !parts
                .get(2)
                .is_some_and(|s| s.trim().eq_ignore_ascii_case("OFF"));
            Ok(RossTalkCommand::Keyer {
                me: parse_num("ME", parts[0])?,
                keyer: parse_num("keyer", parts[1])?,
                on,
                auto: verb.eq_ignore_ascii_case("KEYAUTO"),
            })
        }
        "FTB" => {
            let me = if args.trim().is_empty() {
                1
            } else {
                parse_num("ME", me_args(args)?[0])?
            };
            Ok(RossTalkCommand::FadeToBlack { me })
        }
        "XPT" => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            match parts.as_slice() {
                [level, dest, source] => Ok(RossTalkCommand::Crosspoint {
                    level: level.to_string(),
                    destination: parse_num("destination", dest)?,
                    source: parse_num("source", source)?,
                }),
                _ => Err(DecodeError::MalformedField {
                    field: "XPT",
                    value: args.to_string(),
                }),
            }
        }
        "SALVO" => Ok(RossTalkCommand::Salvo(parse_num("salvo", args)?)),
        _ => Ok(RossTalkCommand::Other(line.to_string())),
    }
}

/// Switcher state tracked from the command stream
#[derive(Debug, Default)]
pub struct RossTalkState {
    armed: HashMap<u8, TransitionKind>,
    program: HashMap<String, u16>,
    keyers: HashMap<(u8, u8), bool>,
}

impl RossTalkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a command, returning the event it produces if any
    pub fn apply(&mut self, command: RossTalkCommand) -> Option<EventPayload> {
        match command {
            RossTalkCommand::MeCut { me } => {
                self.armed.insert(me, TransitionKind::Cut);
                None
            }
            RossTalkCommand::MeAuto { me } => {
                self.armed.insert(me, TransitionKind::Auto);
                None
            }
            RossTalkCommand::Select { bus, me, source } => {
                let bus_name = format!("ME{}{}", me, bus);
                let armed = self.armed.remove(&me);
                let previous = self.program.insert(bus_name.clone(), source);
                let source_name = format!("IN {}", source);
                match armed {
                    Some(transition_kind) => Some(EventPayload::Transition {
                        source_index: source,
                        source_name,
                        bus_name,
                        transition_kind,
                    }),
                    None if previous == Some(source) => None,
                    None => Some(EventPayload::ProgramCut {
                        source_index: source,
                        source_name,
                        bus_name,
                    }),
                }
            }
            RossTalkCommand::Keyer { me, keyer, on, .. } => {
                let was_on = self.keyers.insert((me, keyer), on).unwrap_or(false);
                if was_on == on {
                    return None;
                }
                Some(if on {
                    EventPayload::KeyerOn {
                        me_number: me,
                        keyer_number: keyer,
                    }
                } else {
                    EventPayload::KeyerOff {
                        me_number: me,
                        keyer_number: keyer,
                    }
                })
            }
            RossTalkCommand::FadeToBlack { me } => Some(EventPayload::FadeToBlack { me_number: me }),
            RossTalkCommand::Crosspoint { .. } | RossTalkCommand::Salvo(_) => None,
            RossTalkCommand::Other(line) => {
                tracing::debug!(%line, "Ignoring RossTalk command");
                None
            }
        }
    }
}

/// RossTalk TCP client
pub struct RossTalkClient {
    sink: EventSink,
    status: StatusCell,
    task: Option<ClientTask>,
}

impl RossTalkClient {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            status: StatusCell::default(),
            task: None,
        }
    }

    /// Connect to the switcher and start following its commands
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.disconnect().await;
        self.status.set_connecting();

        let result = async {
            let addr = socket_addr(host, port)?;
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Ok((addr, stream)),
                Ok(Err(source)) => Err(TransportError::Connect { addr, source }),
                Err(_) => Err(TransportError::ConnectTimeout { addr }),
            }
        }
        .await;

        let (addr, stream) = match result {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(error = %e, "RossTalk connect failed");
                self.status.set_failed(e.to_string());
                return Err(e);
            }
        };

        tracing::info!(%addr, "RossTalk connected");
        self.status.set_connected();
        emit(&self.sink, EventDraft::connection(SERVICE_NAME, true, addr.clone()));

        let sink = self.sink.clone();
        let status = self.status.clone();
        self.task = Some(ClientTask::spawn(move |shutdown| {
            run_reader(stream, addr, shutdown, sink, status)
        }));
        Ok(())
    }

    /// Close the connection. Safe to call when not connected.
    pub async fn disconnect(&mut self) {
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

    pub fn status(&self) -> ClientStatus {
        self.status.snapshot()
    }
}

async fn run_reader(
    stream: TcpStream,
    addr: String,
    mut shutdown: oneshot::Receiver<()>,
    sink: EventSink,
    status: StatusCell,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut state = RossTalkState::new();

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    tracing::debug!(%line, "RossTalk");
                    match parse_command(&line) {
                        Ok(cmd) => {
                            if let Some(payload) = state.apply(cmd) {
                                emit(&sink, EventDraft::now(payload));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, %line, "Unparseable RossTalk command");
                            status.record_error(e.to_string());
                        }
                    }
                }
                Ok(None) => break format!("{} closed the connection", addr),
                Err(e) => break format!("{} read failed: {}", addr, e),
            },
        }
    };

    tracing::warn!(%reason, "RossTalk connection lost");
    status.set_failed(reason.clone());
    emit(&sink, EventDraft::connection(SERVICE_NAME, false, reason));
}
