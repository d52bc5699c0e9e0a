//! Touchdrive - live production monitor
//!
//! This library re-exports the protocol clients, event log, sessions and
//! timeline derivation from `touchdrive-core`.
//!
//! The web surface lives in `touchdrive-server`.

pub use touchdrive_core::config;
pub use touchdrive_core::error;
pub use touchdrive_core::events;
pub use touchdrive_core::protocol;
pub use touchdrive_core::session;
pub use touchdrive_core::supervisor;
pub use touchdrive_core::timecode;
pub use touchdrive_core::timeline;

pub use touchdrive_core::{
    build_timeline, AppConfig, ClientStatus, Clip, ConnectionState, ConnectionSupervisor,
    EventDraft, EventId, EventKind, EventPayload, ProductionEvent, ServiceId, SessionManager,
    SessionState, Timecode, TimecodeFormat, Timeline, VERSION,
};
