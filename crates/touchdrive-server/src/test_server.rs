//! Standalone test server for E2E testing
//!
//! Starts the Axum server with a real supervisor and session manager but
//! connects nothing. The tally listener binds to loopback on `TALLY_PORT`
//! (ephemeral by default) so a test can push TSL packets at it.

use touchdrive_core::config::AppConfig;
use touchdrive_core::{ConnectionSupervisor, ServiceId, SessionManager};
use touchdrive_server::{AppState, ServerConfig, SupervisorHandle};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("touchdrive=debug".parse().unwrap()),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8930u16);
    let tally_port = std::env::var("TALLY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0u16);

    let mut config = AppConfig::default();
    config.tally.host = "127.0.0.1".to_string();
    config.tally.port = tally_port;

    let sessions = SessionManager::default();
    let mut supervisor = ConnectionSupervisor::new(config.clone());
    if let Some(events) = supervisor.take_event_stream() {
        sessions.spawn_pump(events, false);
    }
    let handle = SupervisorHandle::spawn(supervisor);
    if let Err(e) = handle.connect(ServiceId::Tally).await {
        tracing::warn!(error = %e, "Tally listener not started");
    }

    let server = ServerConfig {
        port,
        bind_addr: "127.0.0.1".to_string(),
    };
    let state = AppState::new(handle, sessions, config.timeline.clone(), server);

    tracing::info!(port, "Test server starting");

    if let Err(e) = touchdrive_server::start_server(state).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
