// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the shared live timer.
//!
//! Each test runs the real server in-process on an OS-assigned port and
//! drives it through [`SyncClient`] connections, checking that every
//! subscriber converges on the same authoritative snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use rundown::clock::PlaybackClock;
use rundown::sync::{ClientError, ClientOptions, SyncClient, SyncEvent};
use rundown_proto::agenda::{NewItem, Service};
use rundown_proto::auth::{Role, UserIdentity};
use rundown_proto::sync::ErrorKind;
use rundown_proto::timer::{TimerCommand, TimerPhase, TimerState};
use rundown_server::channel::{ServerState, start_server_with_state};
use rundown_server::identity::StaticIdentityProvider;
use rundown_server::store::InMemoryStore;
use tokio::sync::mpsc;

type TestState = ServerState<InMemoryStore, StaticIdentityProvider>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

fn mike() -> UserIdentity {
    UserIdentity::new("1", "Pastor Mike", Role::Planner)
}

async fn start_server() -> (String, Arc<TestState>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let identity = StaticIdentityProvider::new()
        .with_user("tok-mike", mike())
        .with_user("tok-rachel", UserIdentity::new("2", "Rachel", Role::Volunteer))
        .with_user("tok-anna", UserIdentity::new("3", "Anna", Role::Admin));
    let state = Arc::new(ServerState::new(Arc::clone(&store), identity));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state, store)
}

/// Creates "Sunday Morning Service" with Welcome (5 min) and Opening
/// Prayer (2 min), owned by Mike.
async fn seed_service(state: &TestState) -> Service {
    let date = NaiveDate::from_ymd_opt(2025, 4, 14).unwrap();
    let service = state
        .agenda
        .create_service(&mike(), "Sunday Morning Service", date)
        .await
        .unwrap();
    state
        .agenda
        .add_item(&mike(), service.id, NewItem::new("Welcome", 300))
        .await
        .unwrap();
    state
        .agenda
        .add_item(&mike(), service.id, NewItem::new("Opening Prayer", 120))
        .await
        .unwrap()
}

async fn connect(url: &str, token: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    SyncClient::connect(url, token, &ClientOptions::default())
        .await
        .unwrap()
}

/// Waits for the next snapshot, skipping agenda updates.
async fn next_snapshot(events: &mut mpsc::Receiver<SyncEvent>) -> (TimerState, u64, Instant) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(SyncEvent::Snapshot {
                    state,
                    server_time_ms,
                    received_at,
                }) => return (state, server_time_ms, received_at),
                Some(SyncEvent::ServiceUpdated(_)) => continue,
                other => panic!("expected snapshot, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for snapshot")
}

/// Waits for a snapshot with exactly `version`, skipping older ones.
async fn snapshot_with_version(events: &mut mpsc::Receiver<SyncEvent>, version: u64) -> TimerState {
    loop {
        let (state, _, _) = next_snapshot(events).await;
        if state.version >= version {
            assert_eq!(state.version, version, "skipped past expected version");
            return state;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn subscribe_delivers_current_state_immediately() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (rachel, mut events) = connect(&url, "tok-rachel").await;
    let agenda = rachel.subscribe(service.id).await.unwrap();
    assert_eq!(agenda.items.len(), 2);

    match events.recv().await.unwrap() {
        SyncEvent::ServiceUpdated(s) => assert_eq!(s.id, service.id),
        other => panic!("expected ServiceUpdated first, got {other:?}"),
    }
    let (snapshot, _, _) = next_snapshot(&mut events).await;
    assert_eq!(snapshot.phase(), TimerPhase::Idle);
    assert_eq!(snapshot.version, 0);
    assert_eq!(rachel.subscribed_service(), Some(service.id));
}

#[tokio::test]
async fn controller_and_observer_converge() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;
    let welcome = service.items[0].id;
    let prayer = service.items[1].id;

    let (mike, mut mike_events) = connect(&url, "tok-mike").await;
    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;
    mike.subscribe(service.id).await.unwrap();
    rachel.subscribe(service.id).await.unwrap();
    next_snapshot(&mut mike_events).await;
    next_snapshot(&mut rachel_events).await;

    // Start: both sides see item 1 running from zero.
    let acked = mike.start(welcome).await.unwrap();
    assert_eq!(acked.version, 1);
    let seen_by_mike = snapshot_with_version(&mut mike_events, 1).await;
    let seen_by_rachel = snapshot_with_version(&mut rachel_events, 1).await;
    assert_eq!(seen_by_mike, seen_by_rachel);
    assert_eq!(seen_by_rachel.current_item_id, Some(welcome));
    assert!(seen_by_rachel.is_running);

    // Pause, then pause again: the second one is a no-op.
    mike.pause().await.unwrap();
    let paused = snapshot_with_version(&mut rachel_events, 2).await;
    assert!(!paused.is_running);
    let again = mike.pause().await.unwrap();
    assert_eq!(again, paused);

    // Skip: item 2 from zero.
    mike.skip_to_item(prayer).await.unwrap();
    let skipped = snapshot_with_version(&mut rachel_events, 3).await;
    assert_eq!(skipped.current_item_id, Some(prayer));
    assert_eq!(skipped.elapsed_secs, 0);
    assert!(skipped.is_running);
}

#[tokio::test]
async fn observers_render_the_same_frame() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (mike, mut mike_events) = connect(&url, "tok-mike").await;
    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;
    mike.subscribe(service.id).await.unwrap();
    rachel.subscribe(service.id).await.unwrap();
    next_snapshot(&mut mike_events).await;
    next_snapshot(&mut rachel_events).await;

    mike.start(service.items[0].id).await.unwrap();

    let mut clocks = Vec::new();
    for events in [&mut mike_events, &mut rachel_events] {
        let (snapshot, server_time_ms, received_at) = next_snapshot(events).await;
        let mut clock = PlaybackClock::new();
        clock.apply(snapshot, server_time_ms, received_at);
        clocks.push(clock);
    }

    let now = Instant::now() + Duration::from_secs(90);
    let a = clocks[0].frame(&service, now);
    let b = clocks[1].frame(&service, now);
    assert_eq!(a.current_title.as_deref(), Some("Welcome"));
    assert_eq!(a.next_title.as_deref(), Some("Opening Prayer"));
    assert_eq!(a.version, b.version);
    assert!(a.elapsed_secs.abs_diff(b.elapsed_secs) <= 1);
    assert!((89..=91).contains(&a.elapsed_secs));
}

#[tokio::test]
async fn volunteer_without_grant_cannot_control() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (rachel, mut events) = connect(&url, "tok-rachel").await;
    rachel.subscribe(service.id).await.unwrap();
    next_snapshot(&mut events).await;

    let err = rachel.start(service.items[0].id).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::Permission, .. }),
        "got {err:?}"
    );

    // No transition happened.
    let current = state.timers.observe(service.id).await.unwrap();
    assert_eq!(current.version, 0);
}

#[tokio::test]
async fn two_controllers_last_writer_wins() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;
    let welcome = service.items[0].id;
    let prayer = service.items[1].id;

    let (mike, mut mike_events) = connect(&url, "tok-mike").await;
    let (anna, mut anna_events) = connect(&url, "tok-anna").await;
    mike.subscribe(service.id).await.unwrap();
    anna.subscribe(service.id).await.unwrap();
    next_snapshot(&mut mike_events).await;
    next_snapshot(&mut anna_events).await;

    let (a, b) = tokio::join!(mike.start(welcome), anna.skip_to_item(prayer));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.version, b.version);
    let last = if a.version > b.version { a } else { b };
    assert_eq!(last.version, 2);

    let on_mike = snapshot_with_version(&mut mike_events, 2).await;
    let on_anna = snapshot_with_version(&mut anna_events, 2).await;
    assert_eq!(on_mike, last);
    assert_eq!(on_anna, last);
}

#[tokio::test]
async fn strict_write_with_stale_version_conflicts() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (mike, mut events) = connect(&url, "tok-mike").await;
    mike.subscribe(service.id).await.unwrap();
    next_snapshot(&mut events).await;

    let started = mike
        .control(TimerCommand::Start { item_id: service.items[0].id }, Some(0))
        .await
        .unwrap();
    assert_eq!(started.version, 1);

    let err = mike.control(TimerCommand::Pause, Some(0)).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::Conflict, .. }),
        "got {err:?}"
    );
    assert!(mike.control(TimerCommand::Pause, Some(1)).await.is_ok());
}

#[tokio::test]
async fn control_without_subscription_fails() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (mike, _events) = connect(&url, "tok-mike").await;
    let err = mike.start(service.items[0].id).await.unwrap_err();
    assert!(matches!(err, ClientError::NotSubscribed), "got {err:?}");
    assert!(matches!(
        mike.fetch_snapshot().await,
        Err(ClientError::NotSubscribed)
    ));

    mike.subscribe(service.id).await.unwrap();
    mike.unsubscribe().await.unwrap();
    assert!(matches!(mike.pause().await, Err(ClientError::NotSubscribed)));
}

#[tokio::test]
async fn persistence_failure_leaves_state_unchanged() {
    let (url, state, store) = start_server().await;
    let service = seed_service(&state).await;
    let welcome = service.items[0].id;

    let (mike, mut events) = connect(&url, "tok-mike").await;
    mike.subscribe(service.id).await.unwrap();
    next_snapshot(&mut events).await;

    store.set_fail_writes(true);
    match mike.start(welcome).await.unwrap_err() {
        ClientError::Rejected { kind, reason } => {
            assert_eq!(kind, ErrorKind::Persistence);
            assert_eq!(reason, "could not save changes, please retry");
        }
        other => panic!("expected persistence rejection, got {other:?}"),
    }

    mike.fetch_snapshot().await.unwrap();
    let (unchanged, _, _) = next_snapshot(&mut events).await;
    assert_eq!(unchanged.version, 0);
    assert_eq!(unchanged.phase(), TimerPhase::Idle);

    // Retrying once the store recovers succeeds.
    store.set_fail_writes(false);
    assert_eq!(mike.start(welcome).await.unwrap().version, 1);
}

#[tokio::test]
async fn timer_keeps_running_after_controller_leaves() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;
    rachel.subscribe(service.id).await.unwrap();
    next_snapshot(&mut rachel_events).await;

    {
        let (mike, mut mike_events) = connect(&url, "tok-mike").await;
        mike.subscribe(service.id).await.unwrap();
        next_snapshot(&mut mike_events).await;
        mike.start(service.items[0].id).await.unwrap();
        mike.close().await;
    }

    let running = snapshot_with_version(&mut rachel_events, 1).await;
    assert!(running.is_running);

    rachel.fetch_snapshot().await.unwrap();
    let (still, _, _) = next_snapshot(&mut rachel_events).await;
    assert_eq!(still, running);
}

#[tokio::test]
async fn unknown_item_is_not_found() {
    let (url, state, _store) = start_server().await;
    let service = seed_service(&state).await;

    let (mike, mut events) = connect(&url, "tok-mike").await;
    mike.subscribe(service.id).await.unwrap();
    next_snapshot(&mut events).await;

    let err = mike
        .start(rundown_proto::agenda::ItemId::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::NotFound, .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn bad_token_is_rejected_at_handshake() {
    let (url, _state, _store) = start_server().await;
    let err = SyncClient::connect(&url, "tok-nobody", &ClientOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::Unauthenticated, .. }),
        "got {err:?}"
    );
}
