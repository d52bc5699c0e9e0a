//! REST API endpoints for touchdrive
//!
//! All endpoints are under /api/v1/ and return JSON.

use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use touchdrive_core::error::{CommandError, StateConflict};
use touchdrive_core::protocol::hyperdeck::DeckState;
use touchdrive_core::protocol::propresenter::PresentationState;
use touchdrive_core::protocol::tally::TallyDiagnostics;
use touchdrive_core::session::ProductionSession;
use touchdrive_core::supervisor::SupervisorError;
use touchdrive_core::{
    build_timeline, ClientStatus, EventDraft, EventPayload, ProductionEvent, ServiceId,
    SessionState, Timeline,
};

/// Handler errors, mapped to status codes
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    State(#[from] StateConflict),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Supervisor task is not running")]
    Unavailable,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Supervisor(SupervisorError::UnknownService(_)) => StatusCode::NOT_FOUND,
            ApiError::Supervisor(_) | ApiError::Command(_) => StatusCode::BAD_GATEWAY,
            ApiError::State(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

fn parse_service(id: &str) -> Result<ServiceId, ApiError> {
    id.parse().map_err(ApiError::NotFound)
}

/// Connectivity of one service
#[derive(Serialize, Deserialize, Debug)]
pub struct ServiceResponse {
    pub service: String,
    pub state: String,
    pub connected: bool,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl ServiceResponse {
    fn new(service: &ServiceId, status: ClientStatus) -> Self {
        Self {
            service: service.to_string(),
            state: format!("{:?}", status.state),
            connected: status.is_connected(),
            last_error: status.last_error,
            connected_since: status.connected_since,
        }
    }
}

/// Application status response
#[derive(Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub version: String,
    pub recording: bool,
    pub event_count: usize,
    pub services: Vec<ServiceResponse>,
}

/// Session response
#[derive(Serialize)]
pub struct SessionResponse {
    pub state: SessionState,
    pub sessions: Vec<ProductionSession>,
}

/// Event list query
#[derive(Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// Synthetic event to inject
#[derive(Deserialize)]
pub struct InjectRequest {
    pub payload: EventPayload,
    /// Defaults to now
    pub timestamp: Option<DateTime<Utc>>,
}

/// Clear response
#[derive(Serialize)]
pub struct ClearResponse {
    pub removed: usize,
}

/// Recording toggle request
#[derive(Deserialize)]
pub struct RecordingRequest {
    pub enabled: bool,
}

/// Remote URL response
#[derive(Serialize)]
pub struct RemoteUrlResponse {
    pub url: String,
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let services = state.supervisor.statuses().await?;
    Ok(Json(StatusResponse {
        version: touchdrive_core::VERSION.to_string(),
        recording: state.sessions.is_recording(),
        event_count: state.sessions.event_count(),
        services: services
            .into_iter()
            .map(|(id, status)| ServiceResponse::new(&id, status))
            .collect(),
    }))
}

/// GET /api/v1/services
pub async fn list_services(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServiceResponse>>, ApiError> {
    let services = state.supervisor.statuses().await?;
    Ok(Json(
        services
            .into_iter()
            .map(|(id, status)| ServiceResponse::new(&id, status))
            .collect(),
    ))
}

async fn service_status(state: &AppState, service: &ServiceId) -> Result<ServiceResponse, ApiError> {
    state
        .supervisor
        .statuses()
        .await?
        .into_iter()
        .find(|(id, _)| id == service)
        .map(|(id, status)| ServiceResponse::new(&id, status))
        .ok_or_else(|| ApiError::NotFound(format!("Unknown service: {}", service)))
}

/// POST /api/v1/services/{id}/connect
pub async fn connect_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceResponse>, ApiError> {
    let service = parse_service(&id)?;
    state.supervisor.connect(service.clone()).await?;
    Ok(Json(service_status(&state, &service).await?))
}

/// POST /api/v1/services/{id}/disconnect
pub async fn disconnect_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceResponse>, ApiError> {
    let service = parse_service(&id)?;
    state.supervisor.disconnect(service.clone()).await?;
    Ok(Json(service_status(&state, &service).await?))
}

/// POST /api/v1/services/{id}/reconnect
pub async fn reconnect_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceResponse>, ApiError> {
    let service = parse_service(&id)?;
    state.supervisor.reconnect(service.clone()).await?;
    Ok(Json(service_status(&state, &service).await?))
}

/// GET /api/v1/events?limit=N
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<ProductionEvent>>, ApiError> {
    let limit = match query.limit {
        Some(0) => return Err(ApiError::BadRequest("limit must be positive".to_string())),
        Some(limit) => limit,
        None => state.event_display_limit,
    };
    Ok(Json(state.sessions.recent(limit)))
}

/// POST /api/v1/events
///
/// The event goes through the same channel as client events, so it is
/// logged after anything already queued.
pub async fn inject_event(
    State(state): State<AppState>,
    Json(req): Json<InjectRequest>,
) -> Result<StatusCode, ApiError> {
    let draft = match req.timestamp {
        Some(ts) => EventDraft::at(ts, req.payload),
        None => EventDraft::now(req.payload),
    };
    state.supervisor.inject(draft).await?;
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /api/v1/events
pub async fn clear_events(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.sessions.clear_log()?;
    Ok(Json(ClearResponse { removed }))
}

/// GET /api/v1/session
pub async fn get_session(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(SessionResponse {
        state: state.sessions.state(),
        sessions: state.sessions.sessions(),
    })
}

/// POST /api/v1/session/start
pub async fn start_session(
    State(state): State<AppState>,
) -> Result<Json<ProductionSession>, ApiError> {
    Ok(Json(state.sessions.start_session()?))
}

/// POST /api/v1/session/stop
pub async fn stop_session(
    State(state): State<AppState>,
) -> Result<Json<ProductionSession>, ApiError> {
    Ok(Json(state.sessions.stop_session()?))
}

/// POST /api/v1/recording
///
/// Sends record/stop to the deck. Session boundaries are not touched here.
pub async fn set_recording(
    State(state): State<AppState>,
    Json(req): Json<RecordingRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.set_recording(req.enabled).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/timeline
pub async fn get_timeline(State(state): State<AppState>) -> Json<Timeline> {
    let snapshot = state.sessions.snapshot();
    Json(build_timeline(
        &snapshot,
        &state.timeline.tracks,
        &state.timeline.routing,
        Utc::now(),
    ))
}

/// GET /api/v1/tally
pub async fn get_tally(State(state): State<AppState>) -> Result<Json<TallyDiagnostics>, ApiError> {
    Ok(Json(state.supervisor.tally().await?))
}

/// GET /api/v1/deck
pub async fn get_deck(State(state): State<AppState>) -> Result<Json<DeckState>, ApiError> {
    Ok(Json(state.supervisor.deck().await?))
}

/// GET /api/v1/presentations/{id}
pub async fn get_presentation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PresentationState>, ApiError> {
    state
        .supervisor
        .presentation(id.clone())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown presentation: {}", id)))
}

/// GET /api/v1/remote-url
///
/// Returns the address other devices on the network can use.
pub async fn get_remote_url(State(state): State<AppState>) -> Json<RemoteUrlResponse> {
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    Json(RemoteUrlResponse {
        url: format!("http://{}:{}", ip, state.config.port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::from(StateConflict::NotRecording).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(CommandError::NotConnected).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(SupervisorError::UnknownService(ServiceId::Presentation(
                "x".to_string()
            )))
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::BadRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_parse_service() {
        assert_eq!(parse_service("deck").unwrap(), ServiceId::Deck);
        assert!(matches!(parse_service("mixer"), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn test_inject_request_deserializes() {
        let json = r#"{"payload": {"type": "FileTransfer", "fileName": "a.mov", "detail": "done"}}"#;
        let req: InjectRequest = serde_json::from_str(json).unwrap();
        assert!(req.timestamp.is_none());
        assert!(matches!(req.payload, EventPayload::FileTransfer { .. }));
    }

    #[test]
    fn test_status_response_serializes() {
        let resp = StatusResponse {
            version: "0.1.0".to_string(),
            recording: false,
            event_count: 3,
            services: vec![ServiceResponse::new(&ServiceId::Tally, ClientStatus::default())],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"version\":\"0.1.0\""));
        assert!(json.contains("\"service\":\"tally\""));
        assert!(json.contains("\"state\":\"Disconnected\""));
    }
}
