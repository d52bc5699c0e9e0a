//! Touchdrive Core - production monitoring for live video switchers
//!
//! Speaks TSL tally, RossTalk, HyperDeck and ProPresenter concurrently,
//! fuses their notifications into one ordered event log and derives a
//! frame-accurate clip timeline from it.

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod timecode;
pub mod timeline;

pub use config::AppConfig;
pub use events::{EventDraft, EventId, EventKind, EventPayload, ProductionEvent};
pub use protocol::{ClientStatus, ConnectionState, ServiceId};
pub use session::{SessionManager, SessionState};
pub use supervisor::ConnectionSupervisor;
pub use timecode::{Timecode, TimecodeFormat};
pub use timeline::{build_timeline, Clip, Timeline};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
