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

//! Integration tests for agenda editing and the service catalogue over the
//! sync channel: edits reach every subscriber, permissions are enforced,
//! and deleting the item being timed resets the timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rundown::sync::{ClientError, ClientOptions, SyncClient, SyncEvent};
use rundown_proto::agenda::{Direction, ItemPatch, NewItem, Service, UserId};
use rundown_proto::auth::{Role, UserIdentity};
use rundown_proto::sync::ErrorKind;
use rundown_proto::timer::{TimerPhase, TimerState};
use rundown_server::channel::{ServerState, start_server_with_state};
use rundown_server::identity::StaticIdentityProvider;
use rundown_server::store::InMemoryStore;
use tokio::sync::mpsc;

type TestState = ServerState<InMemoryStore, StaticIdentityProvider>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

async fn start_server() -> (String, Arc<TestState>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let identity = StaticIdentityProvider::new()
        .with_user("tok-mike", UserIdentity::new("1", "Pastor Mike", Role::Planner))
        .with_user("tok-rachel", UserIdentity::new("2", "Rachel", Role::Volunteer));
    let state = Arc::new(ServerState::new(Arc::clone(&store), identity));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state, store)
}

async fn connect(url: &str, token: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    SyncClient::connect(url, token, &ClientOptions::default())
        .await
        .unwrap()
}

fn easter() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 4, 20).unwrap()
}

async fn next_event(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_service(events: &mut mpsc::Receiver<SyncEvent>) -> Service {
    loop {
        match next_event(events).await {
            SyncEvent::ServiceUpdated(service) => return service,
            SyncEvent::Snapshot { .. } => continue,
            other => panic!("expected ServiceUpdated, got {other:?}"),
        }
    }
}

async fn next_snapshot(events: &mut mpsc::Receiver<SyncEvent>) -> TimerState {
    loop {
        match next_event(events).await {
            SyncEvent::Snapshot { state, .. } => return state,
            SyncEvent::ServiceUpdated(_) => continue,
            other => panic!("expected Snapshot, got {other:?}"),
        }
    }
}

/// Consumes the ServiceUpdated + Snapshot pair that follows a subscribe.
async fn drain_subscribe(events: &mut mpsc::Receiver<SyncEvent>) {
    next_service(events).await;
    next_snapshot(events).await;
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn create_list_and_edit_service() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut events) = connect(&url, "tok-mike").await;

    let created = mike.create_service("Easter Sunday", easter()).await.unwrap();
    assert!(created.editable_by.contains(&UserId::new("1")));

    let listed = mike.list_services().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    mike.subscribe(created.id).await.unwrap();
    drain_subscribe(&mut events).await;

    mike.add_item(NewItem::new("Welcome", 300)).await.unwrap();
    let after = mike.add_item(NewItem::new("Sermon", 1_800)).await.unwrap();
    assert_eq!(after.items.len(), 2);
    assert_eq!(after.total_duration_secs(), 2_100);

    let renamed = mike
        .update_details(Some("  Easter Sunday Service ".to_string()), None)
        .await
        .unwrap();
    assert_eq!(renamed.title, "Easter Sunday Service");

    let sermon = after.items[1].id;
    let patched = mike
        .update_item(
            sermon,
            ItemPatch {
                duration_secs: Some(2_400),
                notes: Some(Some("Luke 24".to_string())),
                ..ItemPatch::default()
            },
        )
        .await
        .unwrap();
    let item = patched.item(&sermon).unwrap();
    assert_eq!(item.duration_secs, 2_400);
    assert_eq!(item.notes.as_deref(), Some("Luke 24"));
}

#[tokio::test]
async fn edits_reach_other_subscribers() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut mike_events) = connect(&url, "tok-mike").await;
    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    rachel.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut mike_events).await;
    drain_subscribe(&mut rachel_events).await;

    mike.add_item(NewItem::new("Welcome", 300)).await.unwrap();
    let seen = next_service(&mut rachel_events).await;
    assert_eq!(seen.items.len(), 1);
    assert_eq!(seen.items[0].title, "Welcome");
}

#[tokio::test]
async fn move_at_boundary_is_a_noop() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut events) = connect(&url, "tok-mike").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut events).await;
    mike.add_item(NewItem::new("Welcome", 300)).await.unwrap();
    let before = mike.add_item(NewItem::new("Prayer", 120)).await.unwrap();

    let unchanged = mike.move_item(0, Direction::Up).await.unwrap();
    assert_eq!(unchanged.items, before.items);
    let unchanged = mike.move_item(1, Direction::Down).await.unwrap();
    assert_eq!(unchanged.items, before.items);

    let swapped = mike.move_item(0, Direction::Down).await.unwrap();
    assert_eq!(swapped.items[0].title, "Prayer");
    assert_eq!(swapped.items[1].title, "Welcome");
}

#[tokio::test]
async fn deleting_current_item_resets_timer() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut mike_events) = connect(&url, "tok-mike").await;
    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut mike_events).await;
    let with_item = mike.add_item(NewItem::new("Welcome", 300)).await.unwrap();
    let welcome = with_item.items[0].id;

    rachel.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut rachel_events).await;

    mike.start(welcome).await.unwrap();
    let running = next_snapshot(&mut rachel_events).await;
    assert_eq!(running.current_item_id, Some(welcome));

    let emptied = mike.delete_item(welcome).await.unwrap();
    assert!(emptied.items.is_empty());

    // The reset lands before the agenda change.
    match next_event(&mut rachel_events).await {
        SyncEvent::Snapshot { state, .. } => {
            assert_eq!(state.phase(), TimerPhase::Idle);
            assert_eq!(state.version, running.version + 1);
        }
        other => panic!("expected reset snapshot, got {other:?}"),
    }
    let agenda = next_service(&mut rachel_events).await;
    assert!(agenda.items.is_empty());
}

#[tokio::test]
async fn volunteer_needs_a_grant_to_edit() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut mike_events) = connect(&url, "tok-mike").await;
    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    rachel.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut mike_events).await;
    drain_subscribe(&mut rachel_events).await;

    let err = rachel
        .add_item(NewItem::new("Announcements", 180))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::Permission, .. }),
        "got {err:?}"
    );

    mike.add_editor(UserId::new("2")).await.unwrap();
    let edited = rachel
        .add_item(NewItem::new("Announcements", 180))
        .await
        .unwrap();
    assert_eq!(edited.items.len(), 1);

    // A volunteer with a grant may also drive the timer.
    assert!(rachel.start(edited.items[0].id).await.is_ok());

    mike.remove_editor(UserId::new("2")).await.unwrap();
    assert!(matches!(
        rachel.pause().await,
        Err(ClientError::Rejected { kind: ErrorKind::Permission, .. })
    ));
}

#[tokio::test]
async fn creator_grant_cannot_be_revoked() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut events) = connect(&url, "tok-mike").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut events).await;

    let err = mike.remove_editor(UserId::new("1")).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::Invalid, .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn invalid_input_is_rejected() {
    let (url, _state, _store) = start_server().await;
    let (mike, mut events) = connect(&url, "tok-mike").await;

    let err = mike.create_service("   ", easter()).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::Invalid, .. }),
        "got {err:?}"
    );

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut events).await;
    let err = mike.add_item(NewItem::new("Silence", 0)).await.unwrap_err();
    match err {
        ClientError::Rejected { kind, reason } => {
            assert_eq!(kind, ErrorKind::Invalid);
            assert_eq!(reason, "duration must be at least one second");
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
}

#[tokio::test]
async fn agenda_persistence_failure_changes_nothing() {
    let (url, _state, store) = start_server().await;
    let (mike, mut events) = connect(&url, "tok-mike").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    mike.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut events).await;

    store.set_fail_writes(true);
    assert!(matches!(
        mike.add_item(NewItem::new("Welcome", 300)).await,
        Err(ClientError::Rejected { kind: ErrorKind::Persistence, .. })
    ));
    store.set_fail_writes(false);

    let listed = mike.list_services().await.unwrap();
    assert!(listed[0].items.is_empty());
}

#[tokio::test]
async fn deleting_service_notifies_subscribers() {
    let (url, state, _store) = start_server().await;
    let (mike, _mike_events) = connect(&url, "tok-mike").await;
    let (rachel, mut rachel_events) = connect(&url, "tok-rachel").await;

    let service = mike.create_service("Easter Sunday", easter()).await.unwrap();
    rachel.subscribe(service.id).await.unwrap();
    drain_subscribe(&mut rachel_events).await;

    // Volunteers cannot delete.
    assert!(matches!(
        rachel.delete_service(service.id).await,
        Err(ClientError::Rejected { kind: ErrorKind::Permission, .. })
    ));

    mike.delete_service(service.id).await.unwrap();
    match next_event(&mut rachel_events).await {
        SyncEvent::ServiceRemoved(id) => assert_eq!(id, service.id),
        other => panic!("expected ServiceRemoved, got {other:?}"),
    }
    assert!(rachel.subscribed_service().is_none());
    assert!(mike.list_services().await.unwrap().is_empty());
    assert!(state.agenda.get_service(service.id).await.is_err());

    let err = rachel.subscribe(service.id).await.unwrap_err();
    assert!(
        matches!(err, ClientError::Rejected { kind: ErrorKind::NotFound, .. }),
        "got {err:?}"
    );
}
