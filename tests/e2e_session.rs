//! E2E tests for recording sessions
//!
//! Covers the Idle/Recording state machine, session brackets over the log,
//! timecodes relative to session start and deck-driven sessions.

use chrono::TimeDelta;
use std::time::Duration;
use touchdrive::error::StateConflict;
use touchdrive::session::ProductionSession;
use touchdrive::{
    AppConfig, ConnectionSupervisor, EventDraft, EventId, EventKind, EventPayload, SessionManager,
    SessionState, TimecodeFormat,
};

fn cut(source: u16) -> EventDraft {
    EventDraft::now(EventPayload::ProgramCut {
        source_index: source,
        source_name: format!("CAM {}", source),
        bus_name: "PGM".to_string(),
    })
}

fn record(start: bool) -> EventDraft {
    let device = "HyperDeck".to_string();
    EventDraft::now(if start {
        EventPayload::RecordStart {
            device,
            timecode: Some("00:00:00:00".to_string()),
            clip_id: Some(1),
        }
    } else {
        EventPayload::RecordStop {
            device,
            timecode: Some("00:05:00:00".to_string()),
            clip_id: Some(1),
        }
    })
}

#[test]
fn test_two_sessions_numbered_and_bracketed() {
    let manager = SessionManager::default();
    manager.ingest(cut(1));

    let first = manager.start_session().unwrap();
    manager.ingest(cut(2));
    manager.stop_session().unwrap();

    manager.ingest(cut(3));

    let second = manager.start_session().unwrap();
    manager.ingest(cut(4));
    manager.ingest(cut(5));
    let second_closed = manager.stop_session().unwrap();

    assert_eq!(first.number, 1);
    assert_eq!(second.number, 2);
    let history = manager.sessions();
    assert_eq!(history.len(), 2);

    let ids = |s: &ProductionSession| -> Vec<u64> {
        manager
            .session_events(s)
            .iter()
            .map(|e| e.id.0)
            .collect()
    };
    assert_eq!(ids(&history[0]), vec![1]);
    assert_eq!(ids(&second_closed), vec![3, 4]);
    assert!(!history[0].contains(EventId(2)));
}

#[test]
fn test_state_machine_conflicts() {
    let manager = SessionManager::default();
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(manager.stop_session(), Err(StateConflict::NotRecording));

    let session = manager.start_session().unwrap();
    assert_eq!(
        manager.state(),
        SessionState::Recording {
            session: session.clone()
        }
    );
    assert_eq!(manager.current_session(), Some(session));
    assert_eq!(manager.start_session(), Err(StateConflict::AlreadyRecording));
    assert_eq!(manager.clear_log(), Err(StateConflict::ClearWhileRecording));

    let closed = manager.stop_session().unwrap();
    assert!(!closed.is_open());
    assert!(closed.end_time.unwrap() >= closed.start_time);
    assert!(manager.current_session().is_none());
}

#[test]
fn test_clear_keeps_ids_increasing() {
    let manager = SessionManager::default();
    for i in 0..4 {
        manager.ingest(cut(i));
    }
    assert_eq!(manager.clear_log(), Ok(4));
    assert_eq!(manager.event_count(), 0);

    let next = manager.ingest(cut(9));
    assert_eq!(next.id, EventId(4));
}

#[test]
fn test_timecodes_in_drop_frame() {
    let manager = SessionManager::new(TimecodeFormat::new(29.97, true).unwrap(), 0);
    let session = manager.start_session().unwrap();

    let at = |secs: i64| {
        manager.ingest(EventDraft::at(
            session.start_time + TimeDelta::seconds(secs),
            EventPayload::FadeToBlack { me_number: 1 },
        ))
    };
    assert_eq!(at(0).timecode, "00:00:00:00");
    assert_eq!(at(61).timecode, "00:01:01:00");
    assert_eq!(at(600).timecode, "00:10:00:00");
}

#[test]
fn test_start_timecode_offsets_events() {
    let mut config = AppConfig::default();
    config.timeline.frame_rate = 25.0;
    config.timeline.drop_frame = false;
    config.timeline.start_timecode = "10:00:00:00".to_string();

    let manager = SessionManager::from_config(&config.timeline).unwrap();
    assert_eq!(manager.ingest(cut(1)).timecode, "10:00:00:00");

    let session = manager.start_session().unwrap();
    let event = manager.ingest(EventDraft::at(
        session.start_time + TimeDelta::milliseconds(1500),
        EventPayload::FadeToBlack { me_number: 1 },
    ));
    assert_eq!(event.timecode, "10:00:01:12");
}

#[tokio::test]
async fn test_deck_recording_drives_sessions() {
    let sessions = SessionManager::default();
    let mut supervisor = ConnectionSupervisor::new(AppConfig::default());
    let pump = sessions.spawn_pump(supervisor.take_event_stream().unwrap(), true);

    supervisor.inject(cut(1));
    supervisor.inject(record(true));
    supervisor.inject(cut(2));
    supervisor.inject(record(false));
    supervisor.inject(cut(3));
    drop(supervisor);
    tokio::time::timeout(Duration::from_secs(2), pump)
        .await
        .unwrap()
        .unwrap();

    let history = sessions.sessions();
    assert_eq!(history.len(), 1);
    let kinds: Vec<EventKind> = sessions
        .session_events(&history[0])
        .iter()
        .map(|e| e.kind)
        .collect();
    // The start and stop markers belong to the session they bound
    assert_eq!(
        kinds,
        vec![EventKind::RecordStart, EventKind::ProgramCut, EventKind::RecordStop]
    );
    assert!(!sessions.is_recording());
}

#[tokio::test]
async fn test_record_events_advisory_without_follow() {
    let sessions = SessionManager::default();
    let mut supervisor = ConnectionSupervisor::new(AppConfig::default());
    let pump = sessions.spawn_pump(supervisor.take_event_stream().unwrap(), false);

    supervisor.inject(record(true));
    drop(supervisor);
    pump.await.unwrap();

    assert_eq!(sessions.event_count(), 1);
    assert!(!sessions.is_recording());
    assert!(sessions.sessions().is_empty());
}

#[tokio::test]
async fn test_subscribers_see_events_in_log_order() {
    let sessions = SessionManager::default();
    let mut rx = sessions.subscribe();
    for i in 0..20 {
        sessions.ingest(cut(i));
    }
    for i in 0..20u64 {
        assert_eq!(rx.recv().await.unwrap().id, EventId(i));
    }
}
