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

//! Integration tests for [`ServiceSession`]: local ticking, reconnect with
//! backoff, re-subscription after reconnect, and teardown.
//!
//! ## Disconnect simulation
//!
//! [`ServerState::close_all_connections`] sends a close frame on every live
//! socket. The client reader observes the close exactly like a dropped
//! connection, while the server keeps accepting new ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use rundown::session::{ReconnectConfig, ServiceSession, SessionOptions, SessionUpdate};
use rundown::sync::ClientError;
use rundown_proto::agenda::{NewItem, Service, ServiceId};
use rundown_proto::auth::{Role, UserIdentity};
use rundown_proto::timer::TimerPhase;
use rundown_server::channel::{ServerState, start_server_with_state};
use rundown_server::identity::StaticIdentityProvider;
use rundown_server::store::InMemoryStore;
use tokio::sync::mpsc;

type TestState = ServerState<InMemoryStore, StaticIdentityProvider>;

const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

fn mike() -> UserIdentity {
    UserIdentity::new("1", "Pastor Mike", Role::Planner)
}

async fn start_server() -> (String, Arc<TestState>) {
    let store = Arc::new(InMemoryStore::new());
    let identity = StaticIdentityProvider::new()
        .with_user("tok-mike", mike())
        .with_user("tok-rachel", UserIdentity::new("2", "Rachel", Role::Volunteer));
    let state = Arc::new(ServerState::new(store, identity));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

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

/// Fast ticks and short backoff so tests finish quickly.
fn fast_options(url: &str, token: &str) -> SessionOptions {
    let mut options = SessionOptions::new(url, token);
    options.tick = Duration::from_millis(50);
    options.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: 0,
    };
    options
}

/// Waits for the first update matching `pred`, skipping everything else.
async fn wait_for(
    updates: &mut mpsc::Receiver<SessionUpdate>,
    mut pred: impl FnMut(&SessionUpdate) -> bool,
) -> SessionUpdate {
    tokio::time::timeout(UPDATE_TIMEOUT, async {
        loop {
            let update = updates.recv().await.expect("session stopped");
            if pred(&update) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for session update")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(UPDATE_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn session_ticks_frames_for_running_item() {
    let (url, state) = start_server().await;
    let service = seed_service(&state).await;

    let (session, mut updates) = ServiceSession::spawn(fast_options(&url, "tok-mike"), service.id);
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Connected)).await;
    assert!(session.is_connected());

    let idle = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Frame(_))).await;
    let SessionUpdate::Frame(idle) = idle else { unreachable!() };
    assert_eq!(idle.phase, TimerPhase::Idle);
    assert!(idle.next_title.is_none());
    assert_eq!(idle.up_first.as_deref(), Some("Welcome"));

    session.start(service.items[0].id).await.unwrap();
    let running = wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::Frame(f) if f.phase == TimerPhase::Running)
    })
    .await;
    let SessionUpdate::Frame(running) = running else { unreachable!() };
    assert_eq!(running.current_title.as_deref(), Some("Welcome"));
    assert_eq!(running.next_title.as_deref(), Some("Opening Prayer"));
    assert_eq!(running.duration_secs, 300);
    assert!(!running.overrun);

    session.pause().await.unwrap();
    wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::Frame(f) if f.phase == TimerPhase::Paused)
    })
    .await;
    assert_eq!(session.snapshot().unwrap().version, 2);
}

#[tokio::test]
async fn session_resubscribes_after_disconnect() {
    let (url, state) = start_server().await;
    let service = seed_service(&state).await;

    let (session, mut updates) = ServiceSession::spawn(fast_options(&url, "tok-mike"), service.id);
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Connected)).await;
    session.start(service.items[0].id).await.unwrap();
    wait_until(|| session.snapshot().is_some_and(|s| s.version == 1)).await;

    state.close_all_connections().await;
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Disconnected)).await;
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Connected)).await;

    // The fresh subscription re-delivered the running snapshot.
    wait_until(|| session.snapshot().is_some_and(|s| s.version == 1)).await;
    assert!(session.snapshot().unwrap().is_running);

    // Controls work again on the new connection.
    session.skip_to_item(service.items[1].id).await.unwrap();
    let skipped = wait_for(&mut updates, |u| {
        matches!(u, SessionUpdate::Frame(f) if f.current_title.as_deref() == Some("Opening Prayer"))
    })
    .await;
    let SessionUpdate::Frame(skipped) = skipped else { unreachable!() };
    assert!(skipped.next_title.is_none());
    assert!(skipped.elapsed_secs <= 1);
}

#[tokio::test]
async fn observer_session_follows_other_controller() {
    let (url, state) = start_server().await;
    let service = seed_service(&state).await;

    let (controller, mut controller_updates) =
        ServiceSession::spawn(fast_options(&url, "tok-mike"), service.id);
    let (watcher, mut watcher_updates) =
        ServiceSession::spawn(fast_options(&url, "tok-rachel"), service.id);
    wait_for(&mut controller_updates, |u| matches!(u, SessionUpdate::Connected)).await;
    wait_for(&mut watcher_updates, |u| matches!(u, SessionUpdate::Connected)).await;

    controller.start(service.items[0].id).await.unwrap();
    wait_for(&mut watcher_updates, |u| {
        matches!(u, SessionUpdate::Frame(f) if f.phase == TimerPhase::Running)
    })
    .await;
    wait_until(|| controller.snapshot().is_some_and(|s| s.version == 1)).await;
    assert_eq!(watcher.snapshot(), controller.snapshot());

    // The volunteer has no grant, and the refusal does not disturb the timer.
    assert!(watcher.pause().await.is_err());
    assert!(watcher.snapshot().unwrap().is_running);
}

#[tokio::test]
async fn controls_fail_visibly_while_disconnected() {
    // Nothing listens on this port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (session, mut updates) =
        ServiceSession::spawn(fast_options(&format!("ws://{addr}/ws"), "tok-mike"), ServiceId::new());

    assert!(!session.is_connected());
    assert!(matches!(session.pause().await, Err(ClientError::NotConnected)));
    assert!(matches!(session.client(), Err(ClientError::NotConnected)));
    assert!(session.frame().is_none());

    // Still retrying, not given up.
    let outcome = tokio::time::timeout(Duration::from_millis(300), updates.recv()).await;
    assert!(outcome.is_err(), "unexpected update: {outcome:?}");
}

#[tokio::test]
async fn unknown_service_gives_up() {
    let (url, _state) = start_server().await;
    let (_session, mut updates) =
        ServiceSession::spawn(fast_options(&url, "tok-mike"), ServiceId::new());
    let update = wait_for(&mut updates, |u| !matches!(u, SessionUpdate::Frame(_))).await;
    assert!(matches!(update, SessionUpdate::GaveUp(_)), "got {update:?}");
}

#[tokio::test]
async fn dropping_session_tears_down_subscription() {
    let (url, state) = start_server().await;
    let service = seed_service(&state).await;

    let (session, mut updates) = ServiceSession::spawn(fast_options(&url, "tok-rachel"), service.id);
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Connected)).await;
    wait_until(|| state.subscriber_count(service.id) == 1).await;

    drop(session);
    wait_until(|| state.subscriber_count(service.id) == 0).await;
}

#[tokio::test]
async fn deleted_service_stops_session() {
    let (url, state) = start_server().await;
    let service = seed_service(&state).await;

    let (_session, mut updates) = ServiceSession::spawn(fast_options(&url, "tok-rachel"), service.id);
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Connected)).await;

    state.agenda.delete_service(&mike(), service.id).await.unwrap();
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::ServiceRemoved)).await;

    // The session task ended and closed its update channel.
    let closed = tokio::time::timeout(UPDATE_TIMEOUT, async {
        while updates.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn dropping_session_stops_reconnect_attempts() {
    // Accepts every TCP connection and hangs up before the handshake, so the
    // session keeps retrying.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepts);
    let accept_handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    let (session, _updates) =
        ServiceSession::spawn(fast_options(&format!("ws://{addr}/ws"), "tok-mike"), ServiceId::new());
    wait_until(|| accepts.load(Ordering::SeqCst) >= 2).await;

    drop(session);
    // Let an in-flight attempt land before taking the baseline.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let at_drop = accepts.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        accepts.load(Ordering::SeqCst),
        at_drop,
        "connector kept dialing after the session was dropped"
    );
    accept_handle.abort();
}
