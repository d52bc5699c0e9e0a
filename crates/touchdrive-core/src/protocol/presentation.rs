//! ProPresenter client, one per machine
//!
//! Follows the chunked `slide_index` stream and resolves the slide text for
//! every update. A slide whose index or text changed is reported as one
//! `SlideChange`.

use super::propresenter::{
    parse_slide_index, parse_slide_text, ChunkSplitter, PresentationState, SlidePosition,
    VersionInfo,
};
use super::{emit, ClientStatus, ClientTask, EventSink, StatusCell};
use crate::config::PresentationConfig;
use crate::error::ConnectionError;
use crate::events::EventDraft;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Service name for one machine, as used in connection events
pub fn service_name(config: &PresentationConfig) -> String {
    format!("presentation:{}", config.id)
}

/// Presentation API client
pub struct PresentationClient {
    config: PresentationConfig,
    http: reqwest::Client,
    sink: EventSink,
    status: StatusCell,
    state: Arc<Mutex<PresentationState>>,
    version: Option<VersionInfo>,
    task: Option<ClientTask>,
}

impl PresentationClient {
    pub fn new(config: PresentationConfig, sink: EventSink) -> Self {
        Self {
            config,
            http: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            sink,
            status: StatusCell::default(),
            state: Arc::new(Mutex::new(PresentationState::default())),
            version: None,
            task: None,
        }
    }

    pub fn config(&self) -> &PresentationConfig {
        &self.config
    }

    /// Connect to the machine described by `config` and follow its slides
    ///
    /// On failure the client stays disconnected, keeps the reason as its
    /// last error and can be connected again.
    pub async fn connect(&mut self, config: &PresentationConfig) -> Result<(), ConnectionError> {
        self.disconnect().await;
        self.config = config.clone();
        self.status.set_connecting();

        match self.open_stream().await {
            Ok((version, response)) => {
                let base = self.config.base_url();
                tracing::info!(
                    machine = %self.config.display_name(),
                    %base,
                    host = version.host_description.as_deref().unwrap_or("unknown"),
                    "Presentation connected"
                );
                self.version = Some(version);
                self.status.set_connected();
                emit(
                    &self.sink,
                    EventDraft::connection(service_name(&self.config), true, base),
                );

                let worker = StreamWorker {
                    config: self.config.clone(),
                    http: self.http.clone(),
                    sink: self.sink.clone(),
                    status: self.status.clone(),
                    state: self.state.clone(),
                };
                self.task = Some(ClientTask::spawn(move |shutdown| {
                    worker.run(response, shutdown)
                }));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(machine = %self.config.display_name(), error = %e, "Presentation connect failed");
                self.status.set_failed(e.reason.clone());
                Err(e)
            }
        }
    }

    async fn open_stream(&self) -> Result<(VersionInfo, reqwest::Response), ConnectionError> {
        let base = self.config.base_url();
        let failed = |e: reqwest::Error| ConnectionError {
            reason: e.to_string(),
        };

        let version: VersionInfo = self
            .http
            .get(format!("{}/version", base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(failed)?
            .json()
            .await
            .map_err(failed)?;

        // The stream has no overall timeout, only its response headers do
        let request = self
            .http
            .get(format!("{}/v1/presentation/slide_index?chunked=true", base))
            .send();
        let response = tokio::time::timeout(REQUEST_TIMEOUT, request)
            .await
            .map_err(|_| ConnectionError {
                reason: "timed out waiting for slide stream".to_string(),
            })?
            .and_then(|r| r.error_for_status())
            .map_err(failed)?;

        Ok((version, response))
    }

    /// Stop following the machine. Safe to call when not connected.
    pub async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            let was_running = !task.is_finished();
            task.stop().await;
            self.status.set_disconnected();
            if was_running {
                emit(
                    &self.sink,
                    EventDraft::connection(service_name(&self.config), false, "disconnected"),
                );
            }
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status.snapshot()
    }

    pub fn state(&self) -> PresentationState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn version(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }

    /// Thumbnail of the current slide, if fetched
    pub fn thumbnail(&self) -> Option<Vec<u8>> {
        self.state.lock().ok().and_then(|s| s.thumbnail.clone())
    }
}

struct StreamWorker {
    config: PresentationConfig,
    http: reqwest::Client,
    sink: EventSink,
    status: StatusCell,
    state: Arc<Mutex<PresentationState>>,
}

impl StreamWorker {
    async fn run(self, response: reqwest::Response, mut shutdown: oneshot::Receiver<()>) {
        let mut body = response.bytes_stream();
        let mut splitter = ChunkSplitter::new();

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => return,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for document in splitter.push(&bytes) {
                            let position = document.and_then(|doc| parse_slide_index(&doc));
                            match position {
                                Ok(Some(position)) => self.on_position(&position).await,
                                Ok(None) => tracing::debug!("No active presentation"),
                                Err(e) => {
                                    tracing::warn!(error = %e, "Undecodable presentation update");
                                    self.status.record_error(e.to_string());
                                }
                            }
                        }
                    }
                    Some(Err(e)) => break format!("stream failed: {}", e),
                    None => break "stream ended".to_string(),
                },
            }
        };

        tracing::warn!(machine = %self.config.display_name(), %reason, "Presentation connection lost");
        self.status.set_failed(reason.clone());
        emit(
            &self.sink,
            EventDraft::connection(service_name(&self.config), false, reason),
        );
    }

    async fn on_position(&self, position: &SlidePosition) {
        // Unknown text is not a change; the next update retries the fetch
        let text = match self.fetch_text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(slide = position.slide_index, error = %e, "Slide text unavailable");
                self.status.record_error(format!("slide text unavailable: {}", e));
                return;
            }
        };

        let event = match self.state.lock() {
            Ok(mut state) => state.update(position, text),
            Err(_) => return,
        };
        let Some(mut payload) = event else {
            return;
        };
        if let crate::events::EventPayload::SlideChange {
            presentation_name, ..
        } = &mut payload
        {
            if presentation_name.is_empty() {
                *presentation_name = self.config.display_name().to_string();
            }
        }
        emit(&self.sink, EventDraft::now(payload));

        if self.config.fetch_thumbnails {
            match self.fetch_thumbnail(position).await {
                Ok(bytes) => {
                    if let Ok(mut state) = self.state.lock() {
                        if state.slide_index == Some(position.slide_index) {
                            state.thumbnail = Some(bytes);
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Thumbnail unavailable"),
            }
        }
    }

    async fn fetch_text(&self) -> anyhow::Result<String> {
        let body = self
            .http
            .get(format!("{}/v1/status/slide", self.config.base_url()))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_slide_text(&body)?)
    }

    async fn fetch_thumbnail(&self, position: &SlidePosition) -> anyhow::Result<Vec<u8>> {
        let url = format!(
            "{}/v1/presentation/{}/thumbnail/{}",
            self.config.base_url(),
            position.presentation_uuid,
            position.slide_index
        );
        let bytes = self
            .http
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}
