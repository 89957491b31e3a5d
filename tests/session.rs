//! Recording Session Integration Tests
//!
//! End-to-end tests for the session lifecycle and bounded shutdown.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use callrec::core::{
    CallRecorderSession, EgressState, RecorderError, SessionState, StepOutcome,
};
use callrec::domain::{ArtifactKind, Role, TranscriptEvent};

use common::{
    services, settings, EgressBehavior, FakeEgress, MemoryObjects, MemoryStore, PutMode,
};

#[tokio::test]
async fn test_three_events_with_batch_size_two() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::new();
    let services = services(&store, Some(&objects), None);

    let session =
        CallRecorderSession::start("call-1", "room-a", "room-a", &services, &settings(2)).await;
    let handle = session.handle();

    handle.record(Role::User, "hi").unwrap();
    handle.record(Role::Agent, "hello").unwrap();
    handle.record(Role::User, "book a slot").unwrap();

    let outcome = session.shutdown().await;

    // One size-triggered batch of two, one final flush of one
    assert_eq!(*store.batches.lock().unwrap(), vec![vec![0, 1], vec![2]]);
    assert_eq!(store.texts("call-1"), vec!["hi", "hello", "book a slot"]);

    // One transcript containing all three events in order
    let keys = objects.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].ends_with("/room-a/call-1/transcript.jsonl"));
    let body = objects.body(&keys[0]).unwrap();
    let sequences: Vec<u64> = body
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    // One artifact row of kind transcript
    let artifacts = store.artifacts.lock().unwrap().clone();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, ArtifactKind::Transcript);

    assert_eq!(outcome.final_state, SessionState::Closed);
    assert_eq!(
        outcome.transitions,
        vec![SessionState::Draining, SessionState::Finalizing, SessionState::Closed]
    );
    assert_eq!(outcome.events_recorded, 3);
    assert_eq!(outcome.events_unflushed, 0);
    assert_eq!(outcome.transcript_upload, StepOutcome::Succeeded);
    assert!(matches!(outcome.egress_stop, StepOutcome::Skipped { .. }));
    assert!(outcome.is_clean());
    assert!(store.call("call-1").unwrap().ended_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_storage_still_closes_within_deadline() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::with_mode(PutMode::Hang);
    let services = services(&store, Some(&objects), None);
    let settings = settings(50);
    let deadline = settings.shutdown.deadline();

    let session = CallRecorderSession::start("call-2", "room", "room", &services, &settings).await;
    session.handle().record(Role::User, "anyone there?").unwrap();

    let outcome = session.shutdown().await;

    assert_eq!(outcome.final_state, SessionState::Closed);
    assert!(Duration::from_millis(outcome.elapsed_ms) <= deadline);
    assert!(matches!(
        outcome.transcript_upload,
        StepOutcome::Failed { .. } | StepOutcome::TimedOut { .. }
    ));
    assert!(!outcome.is_clean());
    assert!(outcome.artifacts.is_empty());

    // Relational persistence is unaffected
    assert_eq!(outcome.drain, StepOutcome::Succeeded);
    assert_eq!(store.sequences("call-2"), vec![0]);
}

#[tokio::test]
async fn test_unreachable_storage_records_upload_failure() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::with_mode(PutMode::Fail);
    let services = services(&store, Some(&objects), None);

    let session = CallRecorderSession::start("call-3", "room", "room", &services, &settings(50)).await;
    session.handle().record(Role::Agent, "Welcome").unwrap();

    let outcome = session.shutdown().await;

    match outcome.transcript_upload {
        StepOutcome::Failed { ref error } => assert!(error.contains("connection refused")),
        ref other => panic!("unexpected upload outcome: {:?}", other),
    }
    assert_eq!(outcome.final_state, SessionState::Closed);
    assert_eq!(outcome.call_close, StepOutcome::Succeeded);
    assert!(store.artifacts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_database_leaves_events_accounted_for() {
    let store = MemoryStore::new();
    store.fail_always();
    let objects = MemoryObjects::new();
    let services = services(&store, Some(&objects), None);

    let session = CallRecorderSession::start("call-4", "room", "room", &services, &settings(50)).await;
    let handle = session.handle();
    handle.record(Role::User, "one").unwrap();
    handle.record(Role::User, "two").unwrap();

    let outcome = session.shutdown().await;

    assert!(!outcome.drain.is_success());
    assert_eq!(outcome.events_unflushed, 2);
    assert_eq!(outcome.writer.failed_flushes, 1);
    // The transcript still carries everything
    assert_eq!(outcome.transcript_upload, StepOutcome::Succeeded);
    let body = objects.body(&objects.keys()[0]).unwrap();
    assert_eq!(body.lines().count(), 2);
}

#[tokio::test]
async fn test_handle_rejects_events_after_shutdown() {
    let store = MemoryStore::new();
    let services = services(&store, None, None);

    let session = CallRecorderSession::start("call-5", "room", "room", &services, &settings(50)).await;
    let handle = session.handle();
    handle.record(Role::User, "before").unwrap();

    let outcome = session.shutdown().await;
    assert!(matches!(outcome.transcript_upload, StepOutcome::Skipped { .. }));

    assert!(handle.is_closed());
    let late = handle.record(Role::User, "after");
    assert!(matches!(late, Err(RecorderError::SessionClosed { .. })));
    assert_eq!(store.texts("call-5"), vec!["before"]);
}

#[tokio::test]
async fn test_ingest_filters_interim_blank_and_repeated_text() {
    let store = MemoryStore::new();
    let services = services(&store, None, None);

    let session = CallRecorderSession::start("call-6", "room", "room", &services, &settings(50)).await;
    let handle = session.handle();

    let interim = TranscriptEvent {
        role: Role::User,
        text: "I'd like".to_string(),
        is_final: false,
    };
    assert_eq!(handle.on_transcript(&interim).unwrap(), None);
    assert_eq!(handle.record(Role::User, "   ").unwrap(), None);
    assert_eq!(handle.record(Role::User, "  I'd like a slot ").unwrap(), Some(0));
    assert_eq!(handle.record(Role::User, "i'd  LIKE a slot").unwrap(), None);
    assert_eq!(handle.record(Role::Agent, "I'd like a slot").unwrap(), Some(1));
    assert_eq!(handle.record_system("transferred to billing").unwrap(), Some(2));
    assert_eq!(handle.record_system("transferred to billing").unwrap(), Some(3));
    assert_eq!(handle.record_system("  ").unwrap(), None);
    assert_eq!(handle.record(Role::User, "thanks").unwrap(), Some(4));

    session.shutdown().await;

    let rows = store.rows.lock().unwrap().clone();
    let stored: Vec<(Role, String)> = rows.values().map(|e| (e.role, e.text.clone())).collect();
    assert_eq!(
        stored,
        vec![
            (Role::User, "I'd like a slot".to_string()),
            (Role::Agent, "I'd like a slot".to_string()),
            (Role::System, "transferred to billing".to_string()),
            (Role::System, "transferred to billing".to_string()),
            (Role::User, "thanks".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_session_with_egress_records_both_artifacts() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::new();
    let egress = FakeEgress::new(EgressBehavior::CompleteAfter(2));
    let services = services(&store, Some(&objects), Some(&egress));

    let session =
        CallRecorderSession::start("call-7", "lobby", "lk-lobby", &services, &settings(50)).await;
    assert_eq!(session.egress_state().await, EgressState::Active);
    session.handle().record(Role::Agent, "This call is recorded").unwrap();

    let outcome = session.shutdown().await;

    assert_eq!(outcome.egress_stop, StepOutcome::Succeeded);
    assert_eq!(outcome.egress_state, EgressState::Stopped);
    assert_eq!(egress.start_count(), 1);
    assert_eq!(egress.stops.load(Ordering::SeqCst), 1);

    let mut kinds: Vec<&str> = outcome.artifacts.iter().map(|a| a.artifact.kind.as_str()).collect();
    kinds.sort();
    assert_eq!(kinds, vec!["audio", "transcript"]);
    assert!(outcome.artifacts.iter().all(|a| a.record == StepOutcome::Succeeded));
    assert_eq!(store.artifacts.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_egress_stop_does_not_block_close() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::new();
    let egress = FakeEgress::new(EgressBehavior::NeverEnds);
    let services = services(&store, Some(&objects), Some(&egress));

    let session = CallRecorderSession::start("call-8", "room", "room", &services, &settings(50)).await;
    session.handle().record(Role::User, "bye").unwrap();

    let outcome = session.shutdown().await;

    assert_eq!(outcome.final_state, SessionState::Closed);
    assert!(matches!(outcome.egress_stop, StepOutcome::TimedOut { .. }));
    assert_eq!(outcome.egress_state, EgressState::Failed);
    // The transcript still made it
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.artifacts[0].artifact.kind, ArtifactKind::Transcript);
}

#[tokio::test]
async fn test_missing_artifact_table_is_skipped() {
    let store = MemoryStore::without_artifact_table();
    let objects = MemoryObjects::new();
    let services = services(&store, Some(&objects), None);

    let session = CallRecorderSession::start("call-9", "room", "room", &services, &settings(50)).await;
    session.handle().record(Role::User, "hi").unwrap();

    let outcome = session.shutdown().await;

    assert_eq!(outcome.artifacts.len(), 1);
    assert!(matches!(outcome.artifacts[0].record, StepOutcome::Skipped { .. }));
    assert!(outcome.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_start_returns_while_egress_is_still_starting() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::new();
    let egress =
        FakeEgress::with_start_delay(EgressBehavior::CompleteAfter(1), Duration::from_secs(30));
    let services = services(&store, Some(&objects), Some(&egress));

    let began = Instant::now();
    let session = CallRecorderSession::start("call-10", "room", "room", &services, &settings(50)).await;
    assert!(began.elapsed() < Duration::from_millis(100));

    // Events are accepted while the platform has not answered
    let handle = session.handle();
    assert_eq!(handle.record(Role::User, "hello?").unwrap(), Some(0));

    // The start request gives up after the confirmation timeout
    assert_eq!(session.egress_state().await, EgressState::Failed);
    assert_eq!(egress.start_count(), 1);

    let outcome = session.shutdown().await;
    assert_eq!(outcome.final_state, SessionState::Closed);
    assert!(matches!(outcome.egress_stop, StepOutcome::Skipped { .. }));
    assert_eq!(outcome.transcript_upload, StepOutcome::Succeeded);
    assert!(store.call("call-10").unwrap().ended_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_pending_egress_start() {
    let store = MemoryStore::new();
    let objects = MemoryObjects::new();
    let egress =
        FakeEgress::with_start_delay(EgressBehavior::CompleteAfter(1), Duration::from_secs(30));
    let services = services(&store, Some(&objects), Some(&egress));
    let mut settings = settings(50);
    settings.egress.confirm_timeout = Duration::from_secs(60);
    let deadline = settings.shutdown.deadline();

    let session = CallRecorderSession::start("call-11", "room", "room", &services, &settings).await;
    session.handle().record(Role::Agent, "Hello").unwrap();

    let outcome = session.shutdown().await;

    assert_eq!(outcome.final_state, SessionState::Closed);
    assert!(Duration::from_millis(outcome.elapsed_ms) <= deadline);
    assert!(matches!(outcome.egress_stop, StepOutcome::TimedOut { .. }));
    assert_eq!(outcome.egress_state, EgressState::Failed);
    assert_eq!(egress.stops.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.artifacts[0].artifact.kind, ArtifactKind::Transcript);
}

#[tokio::test]
async fn test_persistence_failure_is_visible_while_call_is_active() {
    let store = MemoryStore::new();
    store.fail_always();
    let services = services(&store, None, None);

    let session = CallRecorderSession::start("call-12", "room", "room", &services, &settings(1)).await;
    let handle = session.handle();
    handle.record(Role::User, "first").unwrap();

    let error = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(error) = handle.persistence_error() {
                break error;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(error.contains("batch write"));
    assert!(!handle.is_closed());

    store.heal();
    handle.record(Role::User, "second").unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.persistence_error().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let outcome = session.shutdown().await;
    assert_eq!(store.sequences("call-12"), vec![0, 1]);
    assert_eq!(outcome.events_unflushed, 0);
}
