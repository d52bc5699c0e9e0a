//! E2E tests for the RossTalk client
//!
//! A scripted switcher writes CRLF-terminated commands; the client turns
//! them into production events.

use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use touchdrive::events::TransitionKind;
use touchdrive::protocol::rosstalk::RossTalkClient;
use touchdrive::{ConnectionState, EventDraft, EventPayload};

/// Accept one client, send `script`, then hang up
async fn scripted_switcher(script: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(script.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });
    port
}

async fn collect_until_disconnect(events: &mut UnboundedReceiver<EventDraft>) -> Vec<EventPayload> {
    let mut payloads = Vec::new();
    loop {
        let draft = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("Timed out waiting for events")
            .expect("Event stream closed");
        let done = matches!(
            draft.payload,
            EventPayload::ConnectionChange {
                connected: false,
                ..
            }
        );
        payloads.push(draft.payload);
        if done {
            return payloads;
        }
    }
}

#[tokio::test]
async fn test_switcher_script_becomes_events() {
    let port = scripted_switcher(
        "SELECT PGM:1:IN:2\r\n\
         MEAUTO ME:1\r\n\
         SELECT PGM:1:IN:4\r\n\
         KEYCUT ME:1:1\r\n\
         KEYCUT ME:1:1\r\n\
         KEYAUTO ME:1:1:OFF\r\n\
         GPI 5\r\n\
         FTB\r\n",
    )
    .await;

    let (sink, mut events) = mpsc::unbounded_channel();
    let mut client = RossTalkClient::new(sink);
    client.connect("127.0.0.1", port).await.unwrap();

    let payloads = collect_until_disconnect(&mut events).await;
    let production: Vec<&EventPayload> = payloads
        .iter()
        .filter(|p| !matches!(p, EventPayload::ConnectionChange { .. }))
        .collect();

    assert_eq!(
        production,
        vec![
            &EventPayload::ProgramCut {
                source_index: 2,
                source_name: "IN 2".to_string(),
                bus_name: "ME1PGM".to_string(),
            },
            &EventPayload::Transition {
                source_index: 4,
                source_name: "IN 4".to_string(),
                bus_name: "ME1PGM".to_string(),
                transition_kind: TransitionKind::Auto,
            },
            &EventPayload::KeyerOn {
                me_number: 1,
                keyer_number: 1,
            },
            &EventPayload::KeyerOff {
                me_number: 1,
                keyer_number: 1,
            },
            &EventPayload::FadeToBlack { me_number: 1 },
        ]
    );
    assert!(matches!(
        payloads.first(),
        Some(EventPayload::ConnectionChange { connected: true, .. })
    ));

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(status.last_error.unwrap().contains("closed"));
}

#[tokio::test]
async fn test_garbage_line_does_not_drop_connection() {
    let port = scripted_switcher("SELECT PGM:x:IN:2\r\nMECUT ME:2\r\nSELECT PGM:2:IN:7\r\n").await;

    let (sink, mut events) = mpsc::unbounded_channel();
    let mut client = RossTalkClient::new(sink);
    client.connect("127.0.0.1", port).await.unwrap();

    let payloads = collect_until_disconnect(&mut events).await;
    assert!(payloads.contains(&EventPayload::Transition {
        source_index: 7,
        source_name: "IN 7".to_string(),
        bus_name: "ME2PGM".to_string(),
        transition_kind: TransitionKind::Cut,
    }));
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let (sink, _events) = mpsc::unbounded_channel();
    let mut client = RossTalkClient::new(sink);
    for _ in 0..3 {
        client.connect("127.0.0.1", port).await.unwrap();
        assert!(client.status().is_connected());
        client.disconnect().await;
        assert_eq!(client.status().state, ConnectionState::Disconnected);
    }
}
