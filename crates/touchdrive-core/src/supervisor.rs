//! Connection supervision
//!
//! The supervisor owns one client per configured service, drives their
//! connect/disconnect lifecycles and hands out the single receiving end of
//! the channel all clients report into. It never retries on its own: a
//! failed service keeps its `last_error` until the caller reconnects it.

use crate::config::AppConfig;
use crate::error::{CommandError, ConnectionError, TransportError};
use crate::events::EventDraft;
use crate::protocol::deck::DeckClient;
use crate::protocol::hyperdeck::DeckState;
use crate::protocol::presentation::PresentationClient;
use crate::protocol::propresenter::PresentationState;
use crate::protocol::rosstalk::RossTalkClient;
use crate::protocol::tally::{TallyClient, TallyDiagnostics};
use crate::protocol::tsl::BusState;
use crate::protocol::{ClientStatus, ConnectionState, EventSink, ServiceId};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 5000;

/// Delay before reconnect attempt `attempt` (1-based)
///
/// 500ms, doubling per attempt, capped at 5s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(12);
    let delay = BACKOFF_BASE_MS.saturating_mul(2u64.pow(exponent));
    Duration::from_millis(delay.min(BACKOFF_MAX_MS))
}

/// Errors from per-service supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Unknown service: {0}")]
    UnknownService(ServiceId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Outcome of one service in [`ConnectionSupervisor::connect_all`]
#[derive(Debug)]
pub struct ConnectOutcome {
    pub service: ServiceId,
    pub result: Result<(), SupervisorError>,
}

/// Owner of every protocol client
pub struct ConnectionSupervisor {
    config: AppConfig,
    sink: EventSink,
    events: Option<mpsc::UnboundedReceiver<EventDraft>>,
    tally: TallyClient,
    rosstalk: RossTalkClient,
    deck: DeckClient,
    presentations: BTreeMap<String, PresentationClient>,
}

impl ConnectionSupervisor {
    pub fn new(config: AppConfig) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        let presentations = config
            .presentations
            .iter()
            .map(|p| (p.id.clone(), PresentationClient::new(p.clone(), sink.clone())))
            .collect();
        Self {
            tally: TallyClient::new(sink.clone()),
            rosstalk: RossTalkClient::new(sink.clone()),
            deck: DeckClient::new(sink.clone()),
            presentations,
            events: Some(events),
            sink,
            config,
        }
    }

    /// The receiving end of the fan-in channel; `None` after the first call
    pub fn take_event_stream(&mut self) -> Option<mpsc::UnboundedReceiver<EventDraft>> {
        self.events.take()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Push a synthetic event through the same channel the clients use
    pub fn inject(&self, draft: EventDraft) {
        crate::protocol::emit(&self.sink, draft);
    }

    /// Bring up every enabled service with `config`
    ///
    /// Each service is attempted independently; one failure does not stop
    /// the others.
    pub async fn connect_all(&mut self, config: &AppConfig) -> Vec<ConnectOutcome> {
        self.apply_config(config.clone()).await;
        let mut outcomes = Vec::new();
        for service in self.config.enabled_services() {
            let result = self.connect(&service).await;
            if let Err(e) = &result {
                tracing::warn!(service = %service, error = %e, "Service failed to connect");
            }
            outcomes.push(ConnectOutcome { service, result });
        }
        outcomes
    }

    async fn apply_config(&mut self, config: AppConfig) {
        let removed: Vec<String> = self
            .presentations
            .keys()
            .filter(|id| config.presentation(id).is_none())
            .cloned()
            .collect();
        for id in removed {
            if let Some(mut client) = self.presentations.remove(&id) {
                tracing::info!(machine = %id, "Presentation removed from config");
                client.disconnect().await;
            }
        }
        for p in &config.presentations {
            self.presentations
                .entry(p.id.clone())
                .or_insert_with(|| PresentationClient::new(p.clone(), self.sink.clone()));
        }
        self.deck
            .set_command_timeout(Duration::from_millis(config.deck.command_timeout_ms));
        self.config = config;
    }

    /// Connect one service using the current configuration
    pub async fn connect(&mut self, service: &ServiceId) -> Result<(), SupervisorError> {
        tracing::info!(service = %service, "Connecting");
        match service {
            ServiceId::Tally => {
                let cfg = &self.config.tally;
                self.tally.start_listening(&cfg.host, cfg.port).await?;
            }
            ServiceId::RossTalk => {
                let cfg = &self.config.rosstalk;
                self.rosstalk.connect(&cfg.host, cfg.port).await?;
            }
            ServiceId::Deck => {
                let cfg = &self.config.deck;
                self.deck.connect(&cfg.host, cfg.port).await?;
            }
            ServiceId::Presentation(id) => {
                let cfg = self
                    .config
                    .presentation(id)
                    .cloned()
                    .ok_or_else(|| SupervisorError::UnknownService(service.clone()))?;
                let client = self
                    .presentations
                    .get_mut(id)
                    .ok_or_else(|| SupervisorError::UnknownService(service.clone()))?;
                client.connect(&cfg).await?;
            }
        }
        Ok(())
    }

    pub async fn disconnect(&mut self, service: &ServiceId) -> Result<(), SupervisorError> {
        tracing::info!(service = %service, "Disconnecting");
        match service {
            ServiceId::Tally => self.tally.stop_listening().await,
            ServiceId::RossTalk => self.rosstalk.disconnect().await,
            ServiceId::Deck => self.deck.disconnect().await,
            ServiceId::Presentation(id) => self
                .presentations
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownService(service.clone()))?
                .disconnect()
                .await,
        }
        Ok(())
    }

    pub async fn reconnect(&mut self, service: &ServiceId) -> Result<(), SupervisorError> {
        self.disconnect(service).await?;
        self.connect(service).await
    }

    pub async fn disconnect_all(&mut self) {
        self.tally.stop_listening().await;
        self.rosstalk.disconnect().await;
        self.deck.disconnect().await;
        for client in self.presentations.values_mut() {
            client.disconnect().await;
        }
    }

    /// Every service the supervisor knows about
    pub fn services(&self) -> Vec<ServiceId> {
        let mut services = vec![ServiceId::Tally, ServiceId::RossTalk, ServiceId::Deck];
        services.extend(
            self.presentations
                .keys()
                .map(|id| ServiceId::Presentation(id.clone())),
        );
        services
    }

    pub fn status(&self, service: &ServiceId) -> Option<ClientStatus> {
        match service {
            ServiceId::Tally => Some(self.tally.status()),
            ServiceId::RossTalk => Some(self.rosstalk.status()),
            ServiceId::Deck => Some(self.deck.status()),
            ServiceId::Presentation(id) => self.presentations.get(id).map(|c| c.status()),
        }
    }

    pub fn statuses(&self) -> Vec<(ServiceId, ClientStatus)> {
        self.services()
            .into_iter()
            .filter_map(|s| self.status(&s).map(|status| (s, status)))
            .collect()
    }

    pub fn is_connected(&self, service: &ServiceId) -> bool {
        self.status(service).is_some_and(|s| s.is_connected())
    }

    pub fn last_error(&self, service: &ServiceId) -> Option<String> {
        self.status(service).and_then(|s| s.last_error)
    }

    /// Enabled services whose last attempt failed
    pub fn failed_services(&self) -> Vec<ServiceId> {
        self.config
            .enabled_services()
            .into_iter()
            .filter(|s| {
                self.status(s)
                    .is_some_and(|status| status.state == ConnectionState::Failed)
            })
            .collect()
    }

    pub fn bus_state(&self) -> BusState {
        self.tally.bus_state()
    }

    pub fn tally_diagnostics(&self) -> TallyDiagnostics {
        self.tally.diagnostics()
    }

    pub fn tally_addr(&self) -> Option<std::net::SocketAddr> {
        self.tally.local_addr()
    }

    pub fn deck_state(&self) -> DeckState {
        self.deck.state()
    }

    pub fn presentation_state(&self, id: &str) -> Option<PresentationState> {
        self.presentations.get(id).map(|c| c.state())
    }

    /// Ask the deck to record
    pub async fn start_recording(&self) -> Result<(), CommandError> {
        self.deck.start_recording().await
    }

    pub async fn stop_recording(&self) -> Result<(), CommandError> {
        self.deck.stop_recording().await
    }

    pub fn deck(&self) -> &DeckClient {
        &self.deck
    }

    /// A sender into the fan-in channel, for producers outside the supervisor
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }
}
