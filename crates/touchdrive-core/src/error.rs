//! Error taxonomy shared by the protocol clients and the session layer
//!
//! Every error here is recoverable: clients record them as their `last_error`
//! string and stay usable, the session layer returns them to the caller.

use thiserror::Error;

/// Socket-level failures: bind, connect, unexpected close
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("Socket closed unexpectedly: {0}")]
    Closed(String),
}

/// A frame or response that could not be decoded. The frame is discarded,
/// the connection stays up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("Length mismatch: header says {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unknown header: {0}")]
    UnknownHeader(String),

    #[error("Malformed field {field}: {value}")]
    MalformedField { field: &'static str, value: String },

    #[error("Invalid text encoding in {0}")]
    InvalidText(&'static str),
}

/// Session establishment failure for HTTP-based clients
#[derive(Error, Debug)]
#[error("Connection failed: {reason}")]
pub struct ConnectionError {
    pub reason: String,
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        Self {
            reason: e.to_string(),
        }
    }
}

/// A control command that did not go through
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Not connected")]
    NotConnected,

    #[error("Device rejected command `{command}`: {code} {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    #[error("Command `{0}` timed out")]
    Timeout(String),

    #[error("Connection lost while sending `{0}`")]
    ConnectionLost(String),
}

/// Local precondition failure on the session state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateConflict {
    #[error("A recording session is already open")]
    AlreadyRecording,

    #[error("No recording session is open")]
    NotRecording,

    #[error("Cannot clear the event log while recording")]
    ClearWhileRecording,
}
