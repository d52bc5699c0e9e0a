//! E2E tests for the ProPresenter client against a fake machine
//!
//! The fake serves `/version`, a chunked `slide_index` stream fed by the
//! test, the current slide text and slide thumbnails.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use touchdrive::config::PresentationConfig;
use touchdrive::protocol::presentation::PresentationClient;
use touchdrive::{ConnectionState, EventDraft, EventPayload};

const THUMBNAIL: &[u8] = &[0x89, b'P', b'N', b'G'];

#[derive(Clone, Default)]
struct FakeMachine {
    text: Arc<Mutex<String>>,
    fail_next_text: Arc<AtomicBool>,
    updates: Arc<Mutex<Option<UnboundedReceiver<String>>>>,
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "ProPresenter",
        "platform": "mac",
        "host_description": "Stage Left",
        "api_version": "v1"
    }))
}

async fn slide_index(State(machine): State<FakeMachine>) -> Body {
    let updates = machine.updates.lock().unwrap().take();
    match updates {
        Some(rx) => Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|doc| (Ok::<_, Infallible>(doc), rx))
        })),
        None => Body::empty(),
    }
}

async fn status_slide(
    State(machine): State<FakeMachine>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if machine.fail_next_text.swap(false, Ordering::SeqCst) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let text = machine.text.lock().unwrap().clone();
    Ok(Json(serde_json::json!({ "current": { "text": text } })))
}

async fn thumbnail(Path((_uuid, _index)): Path<(String, u32)>) -> Vec<u8> {
    THUMBNAIL.to_vec()
}

/// Test-side handle on the fake machine's slide stream
struct Operator {
    machine: FakeMachine,
    stream: UnboundedSender<String>,
}

impl Operator {
    /// Move to `index`, with the text the status endpoint will report
    fn show(&self, index: u32, text: &str) {
        *self.machine.text.lock().unwrap() = text.to_string();
        let doc = format!(
            "{{\"presentation_index\":{{\"index\":{},\"presentation_id\":{{\"uuid\":\"A1\",\"name\":\"Sunday\"}}}}}}\r\n\r\n",
            index
        );
        self.stream.send(doc).unwrap();
    }

    /// Make the next slide text request fail
    fn fail_next_text(&self) {
        self.machine.fail_next_text.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.stream
            .send("{\"presentation_index\":null}\r\n\r\n".to_string())
            .unwrap();
    }
}

async fn spawn_machine() -> (u16, Operator) {
    let (stream, rx) = mpsc::unbounded_channel();
    let machine = FakeMachine::default();
    *machine.updates.lock().unwrap() = Some(rx);

    let app = Router::new()
        .route("/version", get(version))
        .route("/v1/presentation/slide_index", get(slide_index))
        .route("/v1/status/slide", get(status_slide))
        .route("/v1/presentation/{uuid}/thumbnail/{index}", get(thumbnail))
        .with_state(machine.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, Operator { machine, stream })
}

async fn next_event(events: &mut UnboundedReceiver<EventDraft>) -> EventPayload {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("Timed out waiting for an event")
        .expect("Event stream closed")
        .payload
}

fn slide(index: u32, text: &str) -> EventPayload {
    EventPayload::SlideChange {
        presentation_name: "Sunday".to_string(),
        slide_index: index,
        slide_text: text.to_string(),
    }
}

async fn connected(config: PresentationConfig) -> (PresentationClient, UnboundedReceiver<EventDraft>) {
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut client = PresentationClient::new(config.clone(), sink);
    client.connect(&config).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        EventPayload::ConnectionChange { connected: true, .. }
    ));
    (client, events)
}

#[tokio::test]
async fn test_slide_changes_become_events() {
    let (port, operator) = spawn_machine().await;
    let config = PresentationConfig::new("stage", "127.0.0.1", port);
    let (client, mut events) = connected(config).await;

    let version = client.version().unwrap();
    assert_eq!(version.host_description.as_deref(), Some("Stage Left"));
    assert!(client.status().is_connected());

    operator.show(0, "Welcome");
    assert_eq!(next_event(&mut events).await, slide(0, "Welcome"));

    operator.show(1, "Amazing grace");
    assert_eq!(next_event(&mut events).await, slide(1, "Amazing grace"));

    let state = client.state();
    assert_eq!(state.slide_index, Some(1));
    assert_eq!(state.presentation_uuid.as_deref(), Some("A1"));
}

#[tokio::test]
async fn test_repeated_slide_is_silent() {
    let (port, operator) = spawn_machine().await;
    let config = PresentationConfig::new("stage", "127.0.0.1", port);
    let (_client, mut events) = connected(config).await;

    operator.show(3, "Verse 1");
    assert_eq!(next_event(&mut events).await, slide(3, "Verse 1"));

    operator.show(3, "Verse 1");
    operator.clear();
    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(quiet.is_err(), "Unexpected event {:?}", quiet);

    // Same index with new text is a new slide
    operator.show(3, "Verse 1 (edited)");
    assert_eq!(next_event(&mut events).await, slide(3, "Verse 1 (edited)"));
}

#[tokio::test]
async fn test_failed_text_fetch_does_not_report_blank_slide() {
    let (port, operator) = spawn_machine().await;
    let config = PresentationConfig::new("stage", "127.0.0.1", port);
    let (client, mut events) = connected(config).await;

    operator.fail_next_text();
    operator.show(3, "Verse 1");
    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(quiet.is_err(), "Unexpected event {:?}", quiet);
    assert!(client.status().is_connected());
    assert!(client.status().last_error.is_some());

    // The retry reports the slide once, with its real text
    operator.show(3, "Verse 1");
    assert_eq!(next_event(&mut events).await, slide(3, "Verse 1"));
    operator.show(3, "Verse 1");
    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(quiet.is_err(), "Unexpected event {:?}", quiet);
}

#[tokio::test]
async fn test_thumbnail_fetched_when_enabled() {
    let (port, operator) = spawn_machine().await;
    let mut config = PresentationConfig::new("stage", "127.0.0.1", port);
    config.fetch_thumbnails = true;
    let (client, mut events) = connected(config).await;

    operator.show(2, "Chorus");
    assert_eq!(next_event(&mut events).await, slide(2, "Chorus"));

    let mut thumbnail = None;
    for _ in 0..50 {
        thumbnail = client.thumbnail();
        if thumbnail.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(thumbnail.as_deref(), Some(THUMBNAIL));
}

#[tokio::test]
async fn test_stream_end_marks_failed() {
    let (port, operator) = spawn_machine().await;
    let config = PresentationConfig::new("stage", "127.0.0.1", port);
    let (client, mut events) = connected(config).await;

    drop(operator);
    match next_event(&mut events).await {
        EventPayload::ConnectionChange {
            service_name,
            connected,
            ..
        } => {
            assert_eq!(service_name, "presentation:stage");
            assert!(!connected);
        }
        other => panic!("Expected disconnect, got {:?}", other),
    }

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.last_error.as_deref(), Some("stream ended"));
}

#[tokio::test]
async fn test_unreachable_machine_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = PresentationConfig::new("booth", "127.0.0.1", port);
    let (sink, _events) = mpsc::unbounded_channel();
    let mut client = PresentationClient::new(config.clone(), sink);

    assert!(client.connect(&config).await.is_err());
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(status.last_error.is_some());
}

/// Machine that answers `/version` but never answers the slide stream
async fn spawn_stalled_machine() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                let mut request_line = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    if request_line.is_none() {
                        request_line = Some(line);
                        continue;
                    }
                    if !line.is_empty() {
                        continue;
                    }
                    let Some(request) = request_line.take() else {
                        continue;
                    };
                    if request.contains("/version") {
                        let body = r#"{"name":"ProPresenter","api_version":"v1"}"#;
                        let reply = format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if write_half.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn test_stalled_slide_stream_fails_connect() {
    let port = spawn_stalled_machine().await;
    let config = PresentationConfig::new("booth", "127.0.0.1", port);
    let (sink, _events) = mpsc::unbounded_channel();
    let mut client = PresentationClient::new(config.clone(), sink);

    let outcome = tokio::time::timeout(Duration::from_secs(10), client.connect(&config))
        .await
        .expect("Connect hung on a silent slide stream");
    assert!(outcome.is_err());
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(status.last_error.is_some());
}
