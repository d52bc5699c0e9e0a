//! Touchdrive Web Server - Axum REST + WebSocket
//!
//! Exposes the monitor's read and write surface to local and remote
//! browsers: service connectivity, the event log, sessions, the clip
//! timeline, and live event streaming.

pub mod api;
pub mod ws;

use api::ApiError;
use axum::http::{header, HeaderValue};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use touchdrive_core::config::TimelineConfig;
use touchdrive_core::error::CommandError;
use touchdrive_core::protocol::hyperdeck::DeckState;
use touchdrive_core::protocol::propresenter::PresentationState;
use touchdrive_core::protocol::tally::TallyDiagnostics;
use touchdrive_core::supervisor::{ConnectOutcome, SupervisorError};
use touchdrive_core::{ClientStatus, ConnectionSupervisor, EventDraft, ServiceId, SessionManager};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

/// Commands sent to the supervisor task
pub enum SupervisorCommand {
    ConnectAll {
        reply: oneshot::Sender<Vec<ConnectOutcome>>,
    },
    Connect {
        service: ServiceId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Disconnect {
        service: ServiceId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Reconnect {
        service: ServiceId,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Statuses {
        reply: oneshot::Sender<Vec<(ServiceId, ClientStatus)>>,
    },
    FailedServices {
        reply: oneshot::Sender<Vec<ServiceId>>,
    },
    Tally {
        reply: oneshot::Sender<TallyDiagnostics>,
    },
    Deck {
        reply: oneshot::Sender<DeckState>,
    },
    Presentation {
        id: String,
        reply: oneshot::Sender<Option<PresentationState>>,
    },
    Recording {
        enabled: bool,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Inject {
        draft: EventDraft,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to communicate with the supervisor task
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    /// Move the supervisor into its own task and return a handle
    ///
    /// Take the event stream out of the supervisor before spawning it.
    pub fn spawn(mut supervisor: ConnectionSupervisor) -> Self {
        let (tx, mut rx) = mpsc::channel::<SupervisorCommand>(32);

        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    SupervisorCommand::ConnectAll { reply } => {
                        let config = supervisor.config().clone();
                        let _ = reply.send(supervisor.connect_all(&config).await);
                    }
                    SupervisorCommand::Connect { service, reply } => {
                        let _ = reply.send(supervisor.connect(&service).await);
                    }
                    SupervisorCommand::Disconnect { service, reply } => {
                        let _ = reply.send(supervisor.disconnect(&service).await);
                    }
                    SupervisorCommand::Reconnect { service, reply } => {
                        let _ = reply.send(supervisor.reconnect(&service).await);
                    }
                    SupervisorCommand::Statuses { reply } => {
                        let _ = reply.send(supervisor.statuses());
                    }
                    SupervisorCommand::FailedServices { reply } => {
                        let _ = reply.send(supervisor.failed_services());
                    }
                    SupervisorCommand::Tally { reply } => {
                        let _ = reply.send(supervisor.tally_diagnostics());
                    }
                    SupervisorCommand::Deck { reply } => {
                        let _ = reply.send(supervisor.deck_state());
                    }
                    SupervisorCommand::Presentation { id, reply } => {
                        let _ = reply.send(supervisor.presentation_state(&id));
                    }
                    SupervisorCommand::Recording { enabled, reply } => {
                        let result = if enabled {
                            supervisor.start_recording().await
                        } else {
                            supervisor.stop_recording().await
                        };
                        let _ = reply.send(result);
                    }
                    SupervisorCommand::Inject { draft } => supervisor.inject(draft),
                    SupervisorCommand::Shutdown { reply } => {
                        supervisor.disconnect_all().await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            tracing::debug!("Supervisor task finished");
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ApiError::Unavailable)?;
        rx.await.map_err(|_| ApiError::Unavailable)
    }

    pub async fn connect_all(&self) -> Result<Vec<ConnectOutcome>, ApiError> {
        self.request(|reply| SupervisorCommand::ConnectAll { reply })
            .await
    }

    pub async fn connect(&self, service: ServiceId) -> Result<(), ApiError> {
        Ok(self
            .request(|reply| SupervisorCommand::Connect { service, reply })
            .await??)
    }

    pub async fn disconnect(&self, service: ServiceId) -> Result<(), ApiError> {
        Ok(self
            .request(|reply| SupervisorCommand::Disconnect { service, reply })
            .await??)
    }

    pub async fn reconnect(&self, service: ServiceId) -> Result<(), ApiError> {
        Ok(self
            .request(|reply| SupervisorCommand::Reconnect { service, reply })
            .await??)
    }

    pub async fn statuses(&self) -> Result<Vec<(ServiceId, ClientStatus)>, ApiError> {
        self.request(|reply| SupervisorCommand::Statuses { reply })
            .await
    }

    pub async fn failed_services(&self) -> Result<Vec<ServiceId>, ApiError> {
        self.request(|reply| SupervisorCommand::FailedServices { reply })
            .await
    }

    pub async fn tally(&self) -> Result<TallyDiagnostics, ApiError> {
        self.request(|reply| SupervisorCommand::Tally { reply }).await
    }

    pub async fn deck(&self) -> Result<DeckState, ApiError> {
        self.request(|reply| SupervisorCommand::Deck { reply }).await
    }

    pub async fn presentation(&self, id: String) -> Result<Option<PresentationState>, ApiError> {
        self.request(|reply| SupervisorCommand::Presentation { id, reply })
            .await
    }

    /// Ask the deck to start or stop recording
    pub async fn set_recording(&self, enabled: bool) -> Result<(), ApiError> {
        Ok(self
            .request(|reply| SupervisorCommand::Recording { enabled, reply })
            .await??)
    }

    /// Queue a synthetic event behind everything the clients already sent
    pub async fn inject(&self, draft: EventDraft) -> Result<(), ApiError> {
        self.tx
            .send(SupervisorCommand::Inject { draft })
            .await
            .map_err(|_| ApiError::Unavailable)
    }

    /// Disconnect everything and end the supervisor task
    pub async fn shutdown(&self) -> Result<(), ApiError> {
        self.request(|reply| SupervisorCommand::Shutdown { reply })
            .await
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    /// Handle to the supervisor task
    pub supervisor: SupervisorHandle,
    /// Event log and recording state
    pub sessions: SessionManager,
    /// Track list and routing used for `/timeline`
    pub timeline: TimelineConfig,
    /// WebSocket broadcast channel
    pub ws_tx: tokio::sync::broadcast::Sender<String>,
    /// Server configuration
    pub config: ServerConfig,
    /// Default number of events returned by `/events`
    pub event_display_limit: usize,
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind address
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8930,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl AppState {
    pub fn new(
        supervisor: SupervisorHandle,
        sessions: SessionManager,
        timeline: TimelineConfig,
        config: ServerConfig,
    ) -> Self {
        let (ws_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            supervisor,
            sessions,
            timeline,
            ws_tx,
            config,
            event_display_limit: 500,
        }
    }
}

/// Build the Axum router with all routes
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    Router::new()
        .route("/api/v1/status", get(api::get_status))
        .route("/api/v1/services", get(api::list_services))
        .route("/api/v1/services/{id}/connect", post(api::connect_service))
        .route(
            "/api/v1/services/{id}/disconnect",
            post(api::disconnect_service),
        )
        .route(
            "/api/v1/services/{id}/reconnect",
            post(api::reconnect_service),
        )
        .route(
            "/api/v1/events",
            get(api::get_events)
                .post(api::inject_event)
                .delete(api::clear_events),
        )
        .route("/api/v1/session", get(api::get_session))
        .route("/api/v1/session/start", post(api::start_session))
        .route("/api/v1/session/stop", post(api::stop_session))
        .route("/api/v1/recording", post(api::set_recording))
        .route("/api/v1/timeline", get(api::get_timeline))
        .route("/api/v1/tally", get(api::get_tally))
        .route("/api/v1/deck", get(api::get_deck))
        .route("/api/v1/presentations/{id}", get(api::get_presentation))
        .route("/api/v1/remote-url", get(api::get_remote_url))
        .route("/api/v1/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .with_state(state)
}

/// Start the web server on an already bound listener
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    ws::spawn_event_forwarder(&state);
    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the web server
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Touchdrive web server listening");
    serve(listener, state).await
}
