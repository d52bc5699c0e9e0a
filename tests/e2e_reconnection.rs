//! E2E tests for service reconnection
//!
//! Verifies the backoff schedule, that a dropped peer leaves its service in
//! `Failed` with a reason, and that reconnecting brings it back while the
//! other services keep running.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use touchdrive::protocol::ServiceId;
use touchdrive::supervisor::backoff_delay;
use touchdrive::{AppConfig, ConnectionState, ConnectionSupervisor, EventPayload, SessionManager};

/// Test exponential backoff calculation
#[test]
fn test_exponential_backoff_schedule() {
    // 500ms -> 1000ms -> 2000ms -> 4000ms -> 5000ms (capped)
    let expected_delays_ms = [500u64, 1000, 2000, 4000, 5000];

    for (attempt, &expected_ms) in expected_delays_ms.iter().enumerate() {
        let delay = backoff_delay(attempt as u32 + 1).as_millis() as u64;
        assert_eq!(
            delay,
            expected_ms,
            "Attempt {} should have {}ms backoff, got {}ms",
            attempt + 1,
            expected_ms,
            delay
        );
    }
}

#[test]
fn test_backoff_cap() {
    assert_eq!(backoff_delay(100), Duration::from_millis(5000));
}

/// Answer the deck's setup commands until the client goes away
async fn serve_deck(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let banner = "500 connection info:\r\nprotocol version: 1.11\r\nmodel: HyperDeck Studio\r\n\r\n";
    if write_half.write_all(banner.as_bytes()).await.is_err() {
        return;
    }
    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match line.trim() {
            cmd if cmd.starts_with("notify:") => "200 ok\r\n",
            "transport info" => "208 transport info:\r\nstatus: stopped\r\n\r\n",
            "slot info" => "202 slot info:\r\nslot id: 1\r\nstatus: mounted\r\n\r\n",
            _ => "100 syntax error\r\n",
        };
        if write_half.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Deck whose first connection is cut when `kill` fires
async fn spawn_flaky_deck() -> (u16, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (kill, killed) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            tokio::select! {
                _ = serve_deck(first) => {}
                _ = killed => {}
            }
        });
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_deck(stream));
        }
    });
    (port, kill)
}

async fn wait_for_state(
    supervisor: &ConnectionSupervisor,
    service: &ServiceId,
    state: ConnectionState,
) {
    for _ in 0..100 {
        if supervisor.status(service).map(|s| s.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "{} never reached {:?}: {:?}",
        service,
        state,
        supervisor.status(service)
    );
}

fn deck_connection_changes(sessions: &SessionManager) -> Vec<bool> {
    sessions
        .events()
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ConnectionChange {
                service_name,
                connected,
                ..
            } if service_name == "deck" => Some(*connected),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_dropped_deck_fails_then_reconnects() {
    let (port, kill) = spawn_flaky_deck().await;

    let mut config = AppConfig::default();
    config.tally.host = "127.0.0.1".to_string();
    config.tally.port = 0;
    config.deck.enabled = true;
    config.deck.host = "127.0.0.1".to_string();
    config.deck.port = port;

    let sessions = SessionManager::default();
    let mut supervisor = ConnectionSupervisor::new(config.clone());
    sessions.spawn_pump(supervisor.take_event_stream().unwrap(), false);
    for outcome in supervisor.connect_all(&config).await {
        assert!(outcome.result.is_ok(), "{} failed", outcome.service);
    }
    assert!(supervisor.is_connected(&ServiceId::Deck));

    let _ = kill.send(());
    wait_for_state(&supervisor, &ServiceId::Deck, ConnectionState::Failed).await;
    assert_eq!(supervisor.failed_services(), vec![ServiceId::Deck]);
    assert!(supervisor.last_error(&ServiceId::Deck).is_some());

    // The tally listener is unaffected
    assert!(supervisor.is_connected(&ServiceId::Tally));

    supervisor.reconnect(&ServiceId::Deck).await.unwrap();
    assert!(supervisor.is_connected(&ServiceId::Deck));
    assert!(supervisor.failed_services().is_empty());

    for _ in 0..100 {
        if deck_connection_changes(&sessions).len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(deck_connection_changes(&sessions), vec![true, false, true]);

    supervisor.disconnect_all().await;
}

#[tokio::test]
async fn test_refused_service_recovers_when_peer_appears() {
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = placeholder.local_addr().unwrap().port();
    drop(placeholder);

    let mut config = AppConfig::default();
    config.tally.enabled = false;
    config.rosstalk.enabled = true;
    config.rosstalk.host = "127.0.0.1".to_string();
    config.rosstalk.port = port;

    let mut supervisor = ConnectionSupervisor::new(config.clone());
    let outcomes = supervisor.connect_all(&config).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_err());
    assert_eq!(supervisor.failed_services(), vec![ServiceId::RossTalk]);

    // Failed services stay failed until asked
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        supervisor.status(&ServiceId::RossTalk).unwrap().state,
        ConnectionState::Failed
    );

    let switcher = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = switcher.accept().await {
            held.push(stream);
        }
    });

    supervisor.reconnect(&ServiceId::RossTalk).await.unwrap();
    assert!(supervisor.is_connected(&ServiceId::RossTalk));
    supervisor.disconnect_all().await;
}

#[tokio::test]
async fn test_tally_listener_restarts() {
    let mut config = AppConfig::default();
    config.tally.host = "127.0.0.1".to_string();
    config.tally.port = 0;

    let mut supervisor = ConnectionSupervisor::new(config);
    for _ in 0..3 {
        supervisor.connect(&ServiceId::Tally).await.unwrap();
        assert!(supervisor.is_connected(&ServiceId::Tally));
        let addr = supervisor.tally_addr().unwrap();
        assert!(TcpStream::connect(addr).await.is_ok());

        supervisor.disconnect(&ServiceId::Tally).await.unwrap();
        assert_eq!(
            supervisor.status(&ServiceId::Tally).unwrap().state,
            ConnectionState::Disconnected
        );
    }
}
