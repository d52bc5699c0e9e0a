//! Event log and recording sessions
//!
//! [`SessionManager`] owns the [`EventLog`] and the Idle/Recording state
//! machine behind one lock, so an append and a session transition never
//! interleave.

mod log;
mod manager;

pub use log::EventLog;
pub use manager::{LogSnapshot, ProductionSession, SessionManager, SessionState};
